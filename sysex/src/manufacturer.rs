use midi_hub_core::{HubError, HubResult};

/// Regional group of a manufacturer, delineated by ID ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManufacturerGroup {
    /// `01..=1F` and `[00,00,..]..=[00,1F,..]`
    NorthAmerica,
    /// `20..=3F` and `[00,20,..]..=[00,3F,..]`
    Europe,
    /// `40..=5F` and `[00,40,..]..=[00,5F,..]`
    Japan,
    /// `60..=7C` and `[00,60,..]..=[00,7F,..]`
    Other,
    /// `7D..=7F`: non-commercial and universal IDs.
    Special,
}

/// SysEx manufacturer ID: one byte, or three bytes with a 0x00 prefix for
/// the extended space. The two universal IDs get their own variants since
/// their frames carry sub-ID structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManufacturerId {
    Standard(u8),
    Extended(u8, u8),
    UniversalNonRealtime,
    UniversalRealtime,
}

impl ManufacturerId {
    /// Decode from the bytes immediately following F0. Returns the ID and
    /// how many bytes it occupied.
    pub fn decode(data: &[u8]) -> HubResult<(Self, usize)> {
        let Some(&first) = data.first() else {
            return Err(HubError::Truncated);
        };
        match first {
            0x00 => {
                if data.len() < 3 {
                    return Err(HubError::Truncated);
                }
                if data[1] > 0x7F || data[2] > 0x7F {
                    return Err(HubError::MalformedPayload(
                        "extended manufacturer ID with high bit set".to_string(),
                    ));
                }
                Ok((ManufacturerId::Extended(data[1], data[2]), 3))
            }
            0x7E => Ok((ManufacturerId::UniversalNonRealtime, 1)),
            0x7F => Ok((ManufacturerId::UniversalRealtime, 1)),
            id if id <= 0x7D => Ok((ManufacturerId::Standard(id), 1)),
            other => Err(HubError::MalformedPayload(format!(
                "manufacturer ID byte 0x{other:02X} has high bit set"
            ))),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ManufacturerId::Standard(id) => out.push(*id),
            ManufacturerId::Extended(hi, lo) => out.extend_from_slice(&[0x00, *hi, *lo]),
            ManufacturerId::UniversalNonRealtime => out.push(0x7E),
            ManufacturerId::UniversalRealtime => out.push(0x7F),
        }
    }

    pub fn group(&self) -> ManufacturerGroup {
        match self {
            ManufacturerId::Standard(id) => match id {
                0x01..=0x1F => ManufacturerGroup::NorthAmerica,
                0x20..=0x3F => ManufacturerGroup::Europe,
                0x40..=0x5F => ManufacturerGroup::Japan,
                0x60..=0x7C => ManufacturerGroup::Other,
                _ => ManufacturerGroup::Special,
            },
            ManufacturerId::Extended(hi, _) => match hi {
                0x00..=0x1F => ManufacturerGroup::NorthAmerica,
                0x20..=0x3F => ManufacturerGroup::Europe,
                0x40..=0x5F => ManufacturerGroup::Japan,
                _ => ManufacturerGroup::Other,
            },
            ManufacturerId::UniversalNonRealtime | ManufacturerId::UniversalRealtime => {
                ManufacturerGroup::Special
            }
        }
    }

    /// Human-readable name for well-known IDs.
    pub fn name(&self) -> Option<&'static str> {
        let name = match self {
            ManufacturerId::Standard(0x01) => "Sequential Circuits",
            ManufacturerId::Standard(0x04) => "Moog",
            ManufacturerId::Standard(0x06) => "Lexicon",
            ManufacturerId::Standard(0x07) => "Kurzweil",
            ManufacturerId::Standard(0x18) => "E-mu",
            ManufacturerId::Standard(0x40) => "Kawai",
            ManufacturerId::Standard(0x41) => "Roland",
            ManufacturerId::Standard(0x42) => "Korg",
            ManufacturerId::Standard(0x43) => "Yamaha",
            ManufacturerId::Standard(0x44) => "Casio",
            ManufacturerId::Standard(0x47) => "Akai",
            ManufacturerId::Standard(0x7D) => "Non-commercial",
            ManufacturerId::UniversalNonRealtime => "Universal non-real-time",
            ManufacturerId::UniversalRealtime => "Universal real-time",
            _ => return None,
        };
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_single_byte() {
        let (id, used) = ManufacturerId::decode(&[0x41, 0x10]).unwrap();
        assert_eq!(id, ManufacturerId::Standard(0x41));
        assert_eq!(used, 1);
        assert_eq!(id.group(), ManufacturerGroup::Japan);
        assert_eq!(id.name(), Some("Roland"));
    }

    #[test]
    fn decode_extended() {
        let (id, used) = ManufacturerId::decode(&[0x00, 0x20, 0x29]).unwrap();
        assert_eq!(id, ManufacturerId::Extended(0x20, 0x29));
        assert_eq!(used, 3);
        assert_eq!(id.group(), ManufacturerGroup::Europe);
    }

    #[test]
    fn decode_universal() {
        assert_eq!(
            ManufacturerId::decode(&[0x7E]).unwrap().0,
            ManufacturerId::UniversalNonRealtime
        );
        assert_eq!(
            ManufacturerId::decode(&[0x7F]).unwrap().0,
            ManufacturerId::UniversalRealtime
        );
    }

    #[test]
    fn encode_round_trip() {
        for id in [
            ManufacturerId::Standard(0x43),
            ManufacturerId::Extended(0x01, 0x55),
            ManufacturerId::UniversalRealtime,
        ] {
            let mut out = Vec::new();
            id.encode(&mut out);
            assert_eq!(ManufacturerId::decode(&out).unwrap().0, id);
        }
    }

    #[test]
    fn truncated_extended_id() {
        assert!(matches!(
            ManufacturerId::decode(&[0x00, 0x20]),
            Err(HubError::Truncated)
        ));
    }
}
