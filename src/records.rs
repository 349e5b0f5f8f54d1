//! Sensor records and their JSON documents
//!
//! Records arrive as packed little-endian structs uploaded by edge
//! devices. Each one knows the topic it is published on and how to render
//! itself as the JSON document the cloud side expects.

use serde::Serialize;

use crate::errors::RecordError;

/// Topic for flash trace uploads and generic incidents
pub const INCIDENTS_TOPIC: &str = "/topic/incidents";

/// Topic for UWB distance readings
pub const LOCATION_TOPIC: &str = "/topic/cat_location";

pub const UWB_PACKET_SIZE: usize = 8;
pub const FLASH_PACKET_SIZE: usize = 32;
pub const FLASH_PACKETS_PER_CHUNK: usize = 8;
pub const TRACE_CHUNK_SIZE: usize = FLASH_PACKET_SIZE * FLASH_PACKETS_PER_CHUNK;
pub const MANUFACTURER_DATA_LEN: usize = 20;

pub const PAGE_HEADER_MAGIC: u16 = 0xDEAD;
pub const PAGE_ENTRY_MAGIC: u16 = 0xC0FE;
pub const PAGE_EMPTY_MAGIC: u16 = 0xFFFF;

/// Anything that can be published through the tracker
pub trait Record {
    /// Topic the document is published on
    fn topic(&self) -> &str;

    /// Encoded payload bytes
    fn to_document(&self) -> Result<Vec<u8>, RecordError>;
}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), RecordError> {
    if bytes.len() != expected {
        return Err(RecordError::InvalidLength {
            expected,
            received: bytes.len(),
        });
    }
    Ok(())
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// UWB distance reading
///
/// # Memory Layout
/// Total size: 8 bytes, packed
/// - distance: 4 bytes (u32)
/// - time: 4 bytes (u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UwbPacket {
    #[serde(rename = "Distance")]
    pub distance: u32,

    #[serde(rename = "Time")]
    pub time: u32,
}

impl UwbPacket {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, UWB_PACKET_SIZE)?;
        Ok(Self {
            distance: le_u32(bytes, 0),
            time: le_u32(bytes, 4),
        })
    }
}

impl Record for UwbPacket {
    fn topic(&self) -> &str {
        LOCATION_TOPIC
    }

    fn to_document(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One 32-byte record as stored in device flash
///
/// # Memory Layout
/// Total size: 32 bytes, packed
/// - kind: 2 bytes (u16 magic)
/// - specifics: 4 bytes (u32, page id for headers, UWB distance for readings)
/// - manufacturer_data: 20 bytes
/// - rssi: 1 byte (i8)
/// - counts: 1 byte (u8)
/// - utc: 4 bytes (i32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashPacket {
    pub kind: u16,
    pub specifics: u32,
    pub manufacturer_data: [u8; MANUFACTURER_DATA_LEN],
    pub rssi: i8,
    pub counts: u8,
    pub utc: i32,
}

impl FlashPacket {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, FLASH_PACKET_SIZE)?;
        let mut manufacturer_data = [0u8; MANUFACTURER_DATA_LEN];
        manufacturer_data.copy_from_slice(&bytes[6..26]);
        Ok(Self {
            kind: le_u16(bytes, 0),
            specifics: le_u32(bytes, 2),
            manufacturer_data,
            rssi: bytes[26] as i8,
            counts: bytes[27],
            utc: le_u32(bytes, 28) as i32,
        })
    }

    pub fn is_reading(&self) -> bool {
        self.kind == PAGE_ENTRY_MAGIC
    }

    pub fn is_header(&self) -> bool {
        self.kind == PAGE_HEADER_MAGIC
    }

    /// Manufacturer data as space-separated upper-case hex
    pub fn adv_code(&self) -> String {
        self.manufacturer_data
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// JSON object for a reading: BLE readings carry RSSI and counts, UWB
    /// readings (RSSI zero) carry the distance instead
    fn to_node(self) -> TraceNode {
        let (rssi, counts, distance_cm) = if self.rssi != 0 {
            (Some(self.rssi), Some(self.counts), None)
        } else {
            (None, None, Some(self.specifics))
        };
        TraceNode {
            adv_code: self.adv_code(),
            rssi,
            counts,
            distance_cm,
        }
    }
}

#[derive(Debug, Serialize)]
struct TraceNode {
    adv_code: String,
    #[serde(rename = "RSSI", skip_serializing_if = "Option::is_none")]
    rssi: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance_cm: Option<u32>,
}

/// Upload unit of up to eight flash packets
///
/// The first packet of a page may be a page header rather than a reading.
/// A partially filled chunk ends at the first non-reading after slot 0;
/// the rest is erased flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceChunk {
    packets: Vec<FlashPacket>,
}

impl TraceChunk {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, TRACE_CHUNK_SIZE)?;
        let packets = bytes
            .chunks_exact(FLASH_PACKET_SIZE)
            .map(FlashPacket::from_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { packets })
    }

    pub fn packets(&self) -> &[FlashPacket] {
        &self.packets
    }

    /// Readings to upload, in flash order
    pub fn readings(&self) -> impl Iterator<Item = &FlashPacket> {
        self.packets
            .iter()
            .enumerate()
            .take_while(|(index, packet)| *index == 0 || packet.is_reading())
            .map(|(_, packet)| packet)
            .filter(|packet| packet.is_reading())
    }
}

impl Record for TraceChunk {
    fn topic(&self) -> &str {
        INCIDENTS_TOPIC
    }

    /// JSON array of readings; a chunk without readings is an
    /// [`RecordError::EmptyChunk`] rather than an empty `[]` upload
    fn to_document(&self) -> Result<Vec<u8>, RecordError> {
        let nodes: Vec<TraceNode> = self.readings().map(|packet| packet.to_node()).collect();
        if nodes.is_empty() {
            return Err(RecordError::EmptyChunk);
        }
        Ok(serde_json::to_vec(&nodes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn flash_bytes(kind: u16, specifics: u32, rssi: i8, counts: u8) -> [u8; FLASH_PACKET_SIZE] {
        let mut bytes = [0u8; FLASH_PACKET_SIZE];
        bytes[0..2].copy_from_slice(&kind.to_le_bytes());
        bytes[2..6].copy_from_slice(&specifics.to_le_bytes());
        for (i, byte) in bytes[6..26].iter_mut().enumerate() {
            *byte = i as u8;
        }
        bytes[26] = rssi as u8;
        bytes[27] = counts;
        bytes[28..32].copy_from_slice(&1_700_000_000i32.to_le_bytes());
        bytes
    }

    fn chunk(packets: &[[u8; FLASH_PACKET_SIZE]]) -> Vec<u8> {
        let mut bytes = vec![0xFF; TRACE_CHUNK_SIZE];
        for (i, packet) in packets.iter().enumerate() {
            bytes[i * FLASH_PACKET_SIZE..(i + 1) * FLASH_PACKET_SIZE].copy_from_slice(packet);
        }
        bytes
    }

    #[test]
    fn test_uwb_packet_document() {
        let mut bytes = [0u8; UWB_PACKET_SIZE];
        bytes[0..4].copy_from_slice(&250u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&1234u32.to_le_bytes());

        let packet = UwbPacket::from_bytes(&bytes).unwrap();
        assert_eq!(packet.topic(), LOCATION_TOPIC);

        let json: Value = serde_json::from_slice(&packet.to_document().unwrap()).unwrap();
        assert_eq!(json["Distance"], 250);
        assert_eq!(json["Time"], 1234);
    }

    #[test]
    fn test_uwb_packet_rejects_wrong_length() {
        assert!(matches!(
            UwbPacket::from_bytes(&[0u8; 7]),
            Err(RecordError::InvalidLength { expected: 8, received: 7 })
        ));
    }

    #[test]
    fn test_flash_packet_fields() {
        let packet = FlashPacket::from_bytes(&flash_bytes(PAGE_ENTRY_MAGIC, 77, -60, 3)).unwrap();

        assert!(packet.is_reading());
        assert_eq!(packet.specifics, 77);
        assert_eq!(packet.rssi, -60);
        assert_eq!(packet.counts, 3);
        assert_eq!(packet.utc, 1_700_000_000);
        assert!(packet.adv_code().starts_with("00 01 02"));
        assert!(packet.adv_code().ends_with("12 13"));
    }

    #[test]
    fn test_trace_chunk_ble_and_uwb_readings() {
        let bytes = chunk(&[
            flash_bytes(PAGE_ENTRY_MAGIC, 0, -70, 4),
            flash_bytes(PAGE_ENTRY_MAGIC, 155, 0, 0),
        ]);
        let chunk = TraceChunk::from_bytes(&bytes).unwrap();

        let json: Value = serde_json::from_slice(&chunk.to_document().unwrap()).unwrap();
        let nodes = json.as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["RSSI"], -70);
        assert_eq!(nodes[0]["counts"], 4);
        assert!(nodes[0].get("distance_cm").is_none());
        assert_eq!(nodes[1]["distance_cm"], 155);
        assert!(nodes[1].get("RSSI").is_none());
    }

    #[test]
    fn test_trace_chunk_skips_leading_header() {
        let bytes = chunk(&[
            flash_bytes(PAGE_HEADER_MAGIC, 12, 0, 0),
            flash_bytes(PAGE_ENTRY_MAGIC, 0, -50, 1),
            flash_bytes(PAGE_ENTRY_MAGIC, 0, -51, 2),
        ]);
        let chunk = TraceChunk::from_bytes(&bytes).unwrap();

        assert!(chunk.packets()[0].is_header());
        assert_eq!(chunk.readings().count(), 2);
    }

    #[test]
    fn test_trace_chunk_stops_at_partial_upload() {
        let bytes = chunk(&[
            flash_bytes(PAGE_ENTRY_MAGIC, 0, -50, 1),
            flash_bytes(PAGE_EMPTY_MAGIC, 0, 0, 0),
            flash_bytes(PAGE_ENTRY_MAGIC, 0, -52, 3),
        ]);
        let chunk = TraceChunk::from_bytes(&bytes).unwrap();

        assert_eq!(chunk.readings().count(), 1);
    }

    #[test]
    fn test_empty_chunk_has_no_document() {
        let chunk = TraceChunk::from_bytes(&vec![0xFF; TRACE_CHUNK_SIZE]).unwrap();
        assert!(matches!(chunk.to_document(), Err(RecordError::EmptyChunk)));
    }
}
