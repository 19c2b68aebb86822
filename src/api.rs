//! Line-delimited JSON control API. Each request is
//! `{"id": .., "command": "..", "params": {..}}`; each response is
//! `{"id": .., "ok": true, "result": ..}` or
//! `{"id": .., "ok": false, "error": ".."}`. A connection that subscribes
//! to SysEx input additionally receives `{"event": ..}` notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use devices::rtp::RtpMidiDevice;
use devices::virtual_dev::VirtualMidiDevice;
use engine::processor::{
    ArpPattern, Arpeggiator, ChannelFilter, ChannelSet, Chord, CurveShape, Delay, Harmonizer,
    Processor, ProcessorChain, ScaleKind, Transpose, VelocityCurve,
};
use engine::Route;
use midi_hub_core::{Event, EventBus, HubError, HubResult, MidiMessage};
use sysex::{Chunker, ManufacturerId, Reassembler, SysExFrame};

use crate::HubContext;

/// The manufacturer ID the hub's own chunked transfer protocol rides on.
pub const CUSTOM_PROTOCOL_ID: ManufacturerId = ManufacturerId::Standard(0x7D);

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

pub fn ok_response(id: &Value, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err_response(id: &Value, error: impl std::fmt::Display) -> Value {
    json!({ "id": id, "ok": false, "error": error.to_string() })
}

/// Dispatch one command against the live service handles.
pub fn dispatch(context: &HubContext, request: &CommandRequest) -> Value {
    let id = &request.id;
    let result = match request.command.as_str() {
        "device.list" => device_list(context),
        "device.connect" => device_connect(context, &request.params),
        "device.disconnect" => device_disconnect(context, &request.params),
        "route.add" => route_add(context, &request.params),
        "route.remove" => with_route_id(&request.params, |rid| {
            context.router.remove_route(rid).map(|_| json!({}))
        }),
        "route.list" => Ok(route_list(context)),
        "route.mute" => with_route_id(&request.params, |rid| {
            let mute = bool_param(&request.params, "mute")?;
            context.router.set_mute(rid, mute).map(|_| json!({}))
        }),
        "route.solo" => with_route_id(&request.params, |rid| {
            let solo = bool_param(&request.params, "solo")?;
            context.router.set_solo(rid, solo).map(|_| json!({}))
        }),
        "route.volume" => with_route_id(&request.params, |rid| {
            let gain = f64_param(&request.params, "gain")? as f32;
            context.router.set_gain(rid, gain).map(|_| json!({}))
        }),
        "route.offset" => with_route_id(&request.params, |rid| {
            let offset = i64_param(&request.params, "offset_us")?;
            context.router.set_offset(rid, offset).map(|_| json!({}))
        }),
        "player.load" => player_load(context, &request.params),
        "player.play" => context.player.play().map(|_| json!({})),
        "player.pause" => context.player.pause().map(|_| json!({})),
        "player.stop" => context.player.stop().map(|_| json!({})),
        "player.seek" => {
            let tick = u64_param(&request.params, "tick");
            tick.and_then(|t| context.player.seek(t).map(|_| json!({})))
        }
        "player.tempo" => {
            let scale = f64_param(&request.params, "scale");
            scale.and_then(|s| context.player.set_tempo_scale(s).map(|_| json!({})))
        }
        "player.transpose" => {
            let semitones = i64_param(&request.params, "semitones");
            semitones.and_then(|s| {
                context
                    .player
                    .set_transpose(s.clamp(-24, 24) as i8)
                    .map(|_| json!({}))
            })
        }
        "player.status" => Ok(player_status(context)),
        "processor.chain_set" => with_route_id(&request.params, |rid| {
            let chain = chain_from_params(rid, &request.params)?;
            context.router.set_chain(rid, chain).map(|_| json!({}))
        }),
        "processor.reset" => {
            let rid = request.params.get("route_id").and_then(Value::as_str);
            context.router.reset_chains(rid).map(|_| json!({}))
        }
        "sysex.send" => sysex_send(context, &request.params),
        "preset.save" => str_param(&request.params, "id").and_then(|id| {
            let bytes: Vec<u8> = request
                .params
                .get("bytes")
                .and_then(Value::as_array)
                .ok_or(HubError::MalformedPayload("missing 'bytes'".to_string()))?
                .iter()
                .filter_map(Value::as_u64)
                .map(|b| b as u8)
                .collect();
            context.presets.save(id, &bytes).map(|_| json!({}))
        }),
        "preset.load" => str_param(&request.params, "id")
            .and_then(|id| context.presets.load(id))
            .map(|bytes| json!({ "bytes": bytes })),
        "preset.list" => context.presets.list().map(|ids| json!({ "presets": ids })),
        // Subscription is connection-level; the server loop flips the
        // flag and we just acknowledge.
        "sysex.on_received_subscribe" => Ok(json!({ "subscribed": true })),
        other => Err(HubError::NotFound {
            entity: "command",
            id: other.to_string(),
        }),
    };
    match result {
        Ok(result) => ok_response(id, result),
        Err(e) => err_response(id, e),
    }
}

fn str_param<'a>(params: &'a Value, key: &'static str) -> HubResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or(HubError::MalformedPayload(format!("missing '{key}'")))
}

fn bool_param(params: &Value, key: &'static str) -> HubResult<bool> {
    params
        .get(key)
        .and_then(Value::as_bool)
        .ok_or(HubError::MalformedPayload(format!("missing '{key}'")))
}

fn u64_param(params: &Value, key: &'static str) -> HubResult<u64> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or(HubError::MalformedPayload(format!("missing '{key}'")))
}

fn i64_param(params: &Value, key: &'static str) -> HubResult<i64> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or(HubError::MalformedPayload(format!("missing '{key}'")))
}

fn f64_param(params: &Value, key: &'static str) -> HubResult<f64> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or(HubError::MalformedPayload(format!("missing '{key}'")))
}

fn with_route_id(
    params: &Value,
    f: impl FnOnce(&str) -> HubResult<Value>,
) -> HubResult<Value> {
    f(str_param(params, "route_id")?)
}

fn device_list(context: &HubContext) -> HubResult<Value> {
    let devices: Vec<Value> = context
        .manager
        .list()
        .into_iter()
        .map(|info| {
            let state = context
                .manager
                .state_of(&info.id)
                .map(|s| s.as_str())
                .unwrap_or("disconnected");
            json!({
                "id": info.id,
                "name": info.name,
                "transport": info.transport.as_str(),
                "direction": info.direction.as_str(),
                "state": state,
                "supports_sysex": info.capabilities.supports_sysex,
            })
        })
        .collect();
    Ok(json!({ "devices": devices }))
}

fn device_connect(context: &HubContext, params: &Value) -> HubResult<Value> {
    let id = str_param(params, "id")?;
    let name = params.get("name").and_then(Value::as_str).unwrap_or(id);
    match str_param(params, "transport")? {
        "virtual" => {
            let (device, _port) =
                VirtualMidiDevice::new(id, name, context.clock.clone());
            context.manager.add(Box::new(device))?;
        }
        "rtp" => {
            // Broadcast sink towards every established RTP peer.
            let device = RtpMidiDevice::new(id, name, None, context.rtp_outbound.clone());
            context.manager.add(Box::new(device))?;
        }
        other => {
            return Err(HubError::UnsupportedFormat(format!(
                "transport '{other}' attaches through OS integration, not the API"
            )));
        }
    }
    Ok(json!({ "id": id }))
}

fn device_disconnect(context: &HubContext, params: &Value) -> HubResult<Value> {
    let id = str_param(params, "id")?;
    context.manager.remove(id)?;
    Ok(json!({}))
}

fn route_list(context: &HubContext) -> Value {
    let routes: Vec<Value> = context
        .router
        .routes()
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "source": r.source_id,
                "sink": r.sink_id,
                "channels": r.channels,
                "mute": r.mute,
                "solo": r.solo,
                "gain": r.gain,
                "offset_us": r.offset_us,
            })
        })
        .collect();
    json!({ "routes": routes })
}

fn route_add(context: &HubContext, params: &Value) -> HubResult<Value> {
    let source = str_param(params, "source")?;
    let sink = str_param(params, "sink")?;
    let mut route = Route::new(source, sink);
    if let Some(channels) = params.get("channels").and_then(Value::as_array) {
        let numbers: Vec<u8> = channels
            .iter()
            .filter_map(Value::as_u64)
            .map(|n| n as u8)
            .collect();
        route.channels = ChannelSet::from_channels(&numbers)?;
    }
    if params.get("processors").is_some() {
        route.chain = chain_from_params(&route.id, params)?;
    }
    let id = route.id.clone();
    context.router.add_route(route)?;
    Ok(json!({ "route_id": id }))
}

fn player_load(context: &HubContext, params: &Value) -> HubResult<Value> {
    let path = str_param(params, "path")?;
    let file = smf::MidiFile::load(path)?;
    context.player.load(file)?;
    let status = context.player.status();
    Ok(json!({ "length_ticks": status.length_ticks }))
}

fn player_status(context: &HubContext) -> Value {
    let status = context.player.status();
    json!({
        "state": status.state.to_string(),
        "tick": status.tick,
        "tempo_scale": status.tempo_scale,
        "transpose": status.transpose,
        "us_per_quarter": status.us_per_quarter,
        "file_loaded": status.file_loaded,
        "length_ticks": status.length_ticks,
    })
}

/// Build a processor chain from a JSON stage list.
fn chain_from_params(chain_id: &str, params: &Value) -> HubResult<ProcessorChain> {
    let specs = params
        .get("processors")
        .and_then(Value::as_array)
        .ok_or(HubError::MalformedPayload("missing 'processors'".to_string()))?;
    let mut stages = Vec::with_capacity(specs.len());
    for spec in specs {
        stages.push(processor_from_spec(spec)?);
    }
    Ok(ProcessorChain::new(chain_id, stages))
}

fn processor_from_spec(spec: &Value) -> HubResult<Processor> {
    let kind = str_param(spec, "type")?;
    let processor = match kind {
        "channel_filter" => {
            let channels: Vec<u8> = spec
                .get("channels")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_u64).map(|n| n as u8).collect())
                .unwrap_or_default();
            Processor::ChannelFilter(ChannelFilter::new(ChannelSet::from_channels(&channels)?))
        }
        "transpose" => {
            let semitones = i64_param(spec, "semitones")?.clamp(-24, 24) as i8;
            Processor::Transpose(Transpose::new(semitones))
        }
        "velocity" => {
            let shape = match spec.get("curve").and_then(Value::as_str).unwrap_or("linear") {
                "linear" => CurveShape::Linear,
                "log" => CurveShape::Log,
                "exp" => CurveShape::Exp,
                other => {
                    return Err(HubError::UnsupportedFormat(format!("velocity curve '{other}'")))
                }
            };
            let gain = spec.get("gain").and_then(Value::as_f64).unwrap_or(1.0) as f32;
            Processor::Velocity(VelocityCurve::new(shape, gain))
        }
        "arpeggiator" => {
            let pattern = match spec.get("pattern").and_then(Value::as_str).unwrap_or("up") {
                "up" => ArpPattern::Up,
                "down" => ArpPattern::Down,
                "updown" => ArpPattern::UpDown,
                "random" => ArpPattern::Random,
                other => {
                    return Err(HubError::UnsupportedFormat(format!("arp pattern '{other}'")))
                }
            };
            let interval_us = u64_param(spec, "interval_ms")? * 1000;
            Processor::Arpeggiator(Arpeggiator::new(pattern, interval_us))
        }
        "delay" => {
            let interval_us = u64_param(spec, "interval_ms")? * 1000;
            let repeats = u64_param(spec, "repeats")? as u32;
            let decay = spec.get("decay").and_then(Value::as_f64).unwrap_or(0.5) as f32;
            Processor::Delay(Delay::new(interval_us, repeats, decay))
        }
        "chord" => {
            let intervals: Vec<i8> = spec
                .get("intervals")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_i64).map(|n| n as i8).collect())
                .unwrap_or_default();
            Processor::Chord(Chord::new(intervals))
        }
        "harmonizer" => {
            let root = u64_param(spec, "root")? as u8;
            let scale = match spec.get("scale").and_then(Value::as_str).unwrap_or("major") {
                "major" => ScaleKind::Major,
                "minor" => ScaleKind::NaturalMinor,
                "chromatic" => ScaleKind::Chromatic,
                other => return Err(HubError::UnsupportedFormat(format!("scale '{other}'"))),
            };
            let degrees: Vec<i32> = spec
                .get("degrees")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_i64).map(|n| n as i32).collect())
                .unwrap_or_default();
            Processor::Harmonizer(Harmonizer::new(root, scale, degrees))
        }
        other => {
            return Err(HubError::UnsupportedFormat(format!("processor '{other}'")));
        }
    };
    Ok(processor)
}

fn sysex_send(context: &HubContext, params: &Value) -> HubResult<Value> {
    let device_id = str_param(params, "device_id")?;
    let payload: Vec<u8> = params
        .get("payload")
        .and_then(Value::as_array)
        .ok_or(HubError::MalformedPayload("missing 'payload'".to_string()))?
        .iter()
        .filter_map(Value::as_u64)
        .map(|b| b as u8)
        .collect();
    if payload.iter().any(|&b| b >= 0x80) {
        return Err(HubError::MalformedPayload(
            "payload bytes must be 7-bit".to_string(),
        ));
    }

    let manufacturer = match params.get("manufacturer") {
        Some(Value::Number(n)) => {
            let byte = n.as_u64().unwrap_or(0) as u8;
            ManufacturerId::decode(&[byte]).map(|(m, _)| m)?
        }
        Some(Value::Array(bytes)) => {
            let raw: Vec<u8> = bytes.iter().filter_map(Value::as_u64).map(|b| b as u8).collect();
            ManufacturerId::decode(&raw).map(|(m, _)| m)?
        }
        _ => CUSTOM_PROTOCOL_ID,
    };

    let frame = SysExFrame::new(manufacturer, payload);
    // The hub's own protocol chunks large payloads; foreign frames go out
    // as-is.
    let frames = if manufacturer == CUSTOM_PROTOCOL_ID {
        Chunker::default().split(&frame)
    } else {
        vec![frame]
    };
    let chunks = frames.len();
    for frame in frames {
        context
            .manager
            .send_to(device_id, &MidiMessage::SysEx(frame.to_bytes()))?;
    }
    Ok(json!({ "chunks": chunks }))
}

/// Feed one received SysEx frame: hub-protocol frames reassemble, anything
/// else publishes directly.
pub fn handle_sysex_input(
    reassembler: &mut Reassembler,
    bus: &EventBus,
    device_id: &str,
    frame_bytes: &[u8],
    now_us: u64,
) {
    let frame = match SysExFrame::parse(frame_bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{device_id}: {e}");
            return;
        }
    };
    if frame.manufacturer == CUSTOM_PROTOCOL_ID {
        match reassembler.feed(device_id, &frame, now_us) {
            Ok(Some(complete)) => bus.publish(Event::SysExReceived {
                device_id: device_id.to_string(),
                frame: complete.to_bytes(),
            }),
            Ok(None) => {}
            Err(e) => warn!("{device_id}: {e}"),
        }
    } else {
        bus.publish(Event::SysExReceived {
            device_id: device_id.to_string(),
            frame: frame_bytes.to_vec(),
        });
    }
}

/// Accept connections and answer commands until the stop token flips.
pub async fn run_api_server(
    port: u16,
    context: HubContext,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("control API listening on 127.0.0.1:{port}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                info!("control client connected from {peer}");
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(socket, context).await {
                        warn!("control client {peer}: {e}");
                    }
                });
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
    info!("control API stopped");
    Ok(())
}

async fn serve_connection(socket: tokio::net::TcpStream, context: HubContext) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut sysex_rx = context.bus.subscribe();
    let mut sysex_subscribed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<CommandRequest>(&line) {
                    Ok(request) => {
                        if request.command == "sysex.on_received_subscribe" {
                            sysex_subscribed = true;
                        }
                        dispatch(&context, &request)
                    }
                    Err(e) => err_response(&Value::Null, format!("bad request: {e}")),
                };
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                writer.write_all(&out).await?;
            }
            event = sysex_rx.recv(), if sysex_subscribed => {
                if let Ok(Event::SysExReceived { device_id, frame }) = event {
                    let notification = json!({
                        "event": "sysex.received",
                        "device_id": device_id,
                        "frame": frame,
                    });
                    let mut out = serde_json::to_vec(&notification)?;
                    out.push(b'\n');
                    writer.write_all(&out).await?;
                }
            }
        }
    }
    Ok(())
}
