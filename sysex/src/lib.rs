//! System Exclusive handling: universal and vendor frame codec,
//! manufacturer ID table, capability descriptors, and the multi-packet
//! chunking protocol with its reassembler.

pub mod capability;
pub mod chunk;
pub mod frame;
pub mod manufacturer;

pub use capability::CapabilityDescriptor;
pub use chunk::{Chunker, ChunkMarker, Reassembler, DEFAULT_MAX_CHUNK_PAYLOAD, REASSEMBLY_TIMEOUT_US};
pub use frame::{SysExFrame, UniversalHeader, SYSEX_END, SYSEX_START};
pub use manufacturer::{ManufacturerGroup, ManufacturerId};
