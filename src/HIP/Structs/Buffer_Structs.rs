// Frames as they cross the transport, and the fixed signal header that
// starts every signal.

/// Bytes in front of the signal inside a segment's signal area: a little
/// endian `u16` signal length followed by two reserved bytes.
pub const FW_HEADER_OFFSET: usize = 4;

/// Signal id of an MA-UNITDATA.REQ
pub const MA_UNITDATA_REQ: u16 = 0x1000;
/// Signal id of an MA-UNITDATA.IND
pub const MA_UNITDATA_IND: u16 = 0x1002;
/// Signal id of an MLME-SET.REQ, used by control traffic in tests and demos
pub const MLME_SET_REQ: u16 = 0x2005;

/// Fixed signal header, little endian on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalHeader {
    pub id: u16,
    pub receiver_pid: u16,
    pub sender_pid: u16,
    pub fw_reference: u32,
}

impl SignalHeader {
    pub const LEN: usize = 10;

    pub fn parse(signal: &[u8]) -> Option<Self> {
        if signal.len() < Self::LEN {
            return None;
        }
        let u16_at = |o: usize| u16::from_le_bytes([signal[o], signal[o + 1]]);
        Some(Self {
            id: u16_at(0),
            receiver_pid: u16_at(2),
            sender_pid: u16_at(4),
            fw_reference: u32::from_le_bytes([signal[6], signal[7], signal[8], signal[9]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].copy_from_slice(&self.receiver_pid.to_le_bytes());
        out[4..6].copy_from_slice(&self.sender_pid.to_le_bytes());
        out[6..10].copy_from_slice(&self.fw_reference.to_le_bytes());
        out
    }
}

/// A signal plus optional bulk payload.
///
/// Outbound frames may carry the payload as several fragments; they are
/// copied in order. Inbound frames always carry one reassembled fragment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub signal: Vec<u8>,
    pub fragments: Vec<Vec<u8>>,
    /// L4 checksum still has to be filled in before the bytes leave the host
    pub csum_partial: bool,
    /// Peer flagged this frame as the reason it woke the host
    pub wakeup: bool,
}

impl Frame {
    pub fn new(signal: Vec<u8>, payload: Vec<u8>) -> Self {
        let fragments = if payload.is_empty() { Vec::new() } else { vec![payload] };
        Self {
            signal,
            fragments,
            ..Default::default()
        }
    }

    pub fn signal_only(signal: Vec<u8>) -> Self {
        Self::new(signal, Vec::new())
    }

    pub fn with_fragments(signal: Vec<u8>, fragments: Vec<Vec<u8>>) -> Self {
        Self {
            signal,
            fragments,
            ..Default::default()
        }
    }

    pub fn payload_len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    /// All fragments concatenated.
    pub fn payload(&self) -> Vec<u8> {
        self.fragments.concat()
    }

    pub fn header(&self) -> Option<SignalHeader> {
        SignalHeader::parse(&self.signal)
    }

    pub fn signal_id(&self) -> u16 {
        self.header().map(|h| h.id).unwrap_or(0)
    }
}
