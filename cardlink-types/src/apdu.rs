//! ISO 7816-4 APDU encoding, decoding and status-word classification.
//!
//! Command APDUs follow the four ISO cases with the short/extended length
//! split decided by the data length and `Le`. Parsing is strict: any bytes
//! beyond the declared `Lc`/`Le` structure fail with
//! [`ApduError::LengthMismatch`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest command data field (`Lc`) the extended encoding can carry.
pub const MAX_LC: usize = 65_535;
/// Largest expected response length (`Le`) the extended encoding can carry.
pub const MAX_LE: u32 = 65_536;

/// Errors produced by the APDU codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApduError {
    /// Fewer than the 4 mandatory header bytes.
    #[error("command shorter than the 4 byte header")]
    TooShort,
    /// Byte count does not match any ISO 7816-4 case.
    #[error("length_mismatch: {0}")]
    LengthMismatch(&'static str),
    /// Data field larger than [`MAX_LC`].
    #[error("data field of {0} bytes exceeds the extended Lc limit")]
    DataTooLong(usize),
    /// `Le` outside `1..=65536`.
    #[error("invalid Le value {0}")]
    InvalidLe(u32),
    /// Response shorter than the 2 status-word bytes.
    #[error("response shorter than the 2 byte status word")]
    ResponseTooShort,
}

/// A command APDU.
#[derive(Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Class byte.
    pub cla: u8,
    /// Instruction byte.
    pub ins: u8,
    /// First parameter byte.
    pub p1: u8,
    /// Second parameter byte.
    pub p2: u8,
    /// Command data field, empty for cases 1 and 2.
    pub data: Vec<u8>,
    /// Expected response length, `None` for cases 1 and 3.
    pub le: Option<u32>,
}

impl Apdu {
    /// Builds a case-1 command (header only).
    pub fn case1(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2, data: Vec::new(), le: None }
    }

    /// Builds a case-2 command (header + `Le`).
    pub fn case2(cla: u8, ins: u8, p1: u8, p2: u8, le: u32) -> Self {
        Self { cla, ins, p1, p2, data: Vec::new(), le: Some(le) }
    }

    /// Builds a case-3 command (header + data).
    pub fn case3(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self { cla, ins, p1, p2, data, le: None }
    }

    /// Builds a case-4 command (header + data + `Le`).
    pub fn case4(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, le: u32) -> Self {
        Self { cla, ins, p1, p2, data, le: Some(le) }
    }

    /// The `GET RESPONSE` command inserted when a card answers `61xx`.
    ///
    /// `le` of `0x00` asks for 256 bytes, matching the short-form wildcard.
    pub fn get_response(le: u8) -> Self {
        let le = if le == 0 { 256 } else { u32::from(le) };
        Self::case2(0x00, 0xC0, 0x00, 0x00, le)
    }

    /// Returns a copy of this command with `Le` replaced, as required by
    /// the `6Cxx` retry rule.
    pub fn with_le(&self, le: u8) -> Self {
        let le = if le == 0 { 256 } else { u32::from(le) };
        Self { le: Some(le), ..self.clone() }
    }

    /// Whether this command needs the extended length encoding.
    fn extended(&self) -> bool {
        self.data.len() > 255 || self.le.is_some_and(|le| le > 256)
    }

    /// Encodes the command into its ISO 7816-4 byte form.
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        if self.data.len() > MAX_LC {
            return Err(ApduError::DataTooLong(self.data.len()));
        }
        if let Some(le) = self.le
            && !(1..=MAX_LE).contains(&le)
        {
            return Err(ApduError::InvalidLe(le));
        }
        let mut out = Vec::with_capacity(9 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        let lc = self.data.len();
        if self.extended() {
            if lc > 0 {
                out.push(0x00);
                out.extend_from_slice(&(lc as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
                if let Some(le) = self.le {
                    // Le of 65536 is the extended wildcard 0x0000.
                    out.extend_from_slice(&((le % 65_536) as u16).to_be_bytes());
                }
            } else if let Some(le) = self.le {
                out.push(0x00);
                out.extend_from_slice(&((le % 65_536) as u16).to_be_bytes());
            }
        } else {
            if lc > 0 {
                out.push(lc as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                // Le of 256 is the short wildcard 0x00.
                out.push((le % 256) as u8);
            }
        }
        Ok(out)
    }

    /// Decodes a command APDU, rejecting any byte layout that does not
    /// match one of the ISO cases.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 4 {
            return Err(ApduError::TooShort);
        }
        let (cla, ins, p1, p2) = (bytes[0], bytes[1], bytes[2], bytes[3]);
        let rest = &bytes[4..];
        match rest.len() {
            // case 1
            0 => Ok(Self::case1(cla, ins, p1, p2)),
            // case 2 short; 0x00 means 256
            1 => {
                let le = if rest[0] == 0 { 256 } else { u32::from(rest[0]) };
                Ok(Self::case2(cla, ins, p1, p2, le))
            }
            _ if rest[0] != 0 => {
                let lc = usize::from(rest[0]);
                let body = &rest[1..];
                if body.len() == lc {
                    Ok(Self::case3(cla, ins, p1, p2, body.to_vec()))
                } else if body.len() == lc + 1 {
                    let le_byte = body[lc];
                    let le = if le_byte == 0 { 256 } else { u32::from(le_byte) };
                    Ok(Self::case4(cla, ins, p1, p2, body[..lc].to_vec(), le))
                } else {
                    Err(ApduError::LengthMismatch("short body"))
                }
            }
            // extended forms: 4-byte header, 0x00 marker, 2-byte fields
            2 => Err(ApduError::LengthMismatch("truncated extended header")),
            3 => {
                // case 2 extended; 0x0000 means 65536
                let le = u32::from(u16::from_be_bytes([rest[1], rest[2]]));
                let le = if le == 0 { MAX_LE } else { le };
                Ok(Self::case2(cla, ins, p1, p2, le))
            }
            _ => {
                let lc = usize::from(u16::from_be_bytes([rest[1], rest[2]]));
                if lc == 0 {
                    return Err(ApduError::LengthMismatch("extended Lc of zero"));
                }
                let body = &rest[3..];
                if body.len() == lc {
                    Ok(Self::case3(cla, ins, p1, p2, body.to_vec()))
                } else if body.len() == lc + 2 {
                    let le = u32::from(u16::from_be_bytes([body[lc], body[lc + 1]]));
                    let le = if le == 0 { MAX_LE } else { le };
                    Ok(Self::case4(cla, ins, p1, p2, body[..lc].to_vec(), le))
                } else {
                    Err(ApduError::LengthMismatch("extended body"))
                }
            }
        }
    }
}

impl fmt::Debug for Apdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Apdu(cla={:02X} ins={:02X} p1={:02X} p2={:02X} lc={} le={:?})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len(),
            self.le
        )
    }
}

/// A response APDU.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data field, possibly empty.
    pub data: Vec<u8>,
    /// First status byte.
    pub sw1: u8,
    /// Second status byte.
    pub sw2: u8,
}

impl ApduResponse {
    /// Builds a response from data and the two status bytes.
    pub fn new(data: Vec<u8>, sw1: u8, sw2: u8) -> Self {
        Self { data, sw1, sw2 }
    }

    /// Builds a data-less response from a 16-bit status word.
    pub fn from_sw(sw: u16) -> Self {
        Self::new(Vec::new(), (sw >> 8) as u8, (sw & 0xFF) as u8)
    }

    /// The combined 16-bit status word.
    pub fn sw(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Encodes the response as data followed by `SW1 SW2`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push(self.sw1);
        out.push(self.sw2);
        out
    }

    /// Decodes a response APDU. Everything before the trailing two bytes
    /// is the data field.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 2 {
            return Err(ApduError::ResponseTooShort);
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self::new(data.to_vec(), sw[0], sw[1]))
    }
}

impl fmt::Debug for ApduResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApduResponse(len={} sw={:04X})", self.data.len(), self.sw())
    }
}

/// Outcome class of a status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Command executed (includes `61xx` and the `9xxx` proprietary range).
    Success,
    /// Executed with a warning (`62xx`, `63xx`).
    Warning,
    /// Execution or checking error (`64xx`..`6Fxx`).
    Error,
    /// Not covered by ISO 7816-4.
    Unknown,
}

/// Classifies a 16-bit status word.
pub fn classify(sw: u16) -> StatusClass {
    match sw >> 8 {
        0x61 | 0x90..=0x9F => StatusClass::Success,
        0x62 | 0x63 => StatusClass::Warning,
        0x64..=0x6F => StatusClass::Error,
        _ => StatusClass::Unknown,
    }
}

/// For `61xx`: the number of response bytes still available on the card.
pub fn more_data(sw: u16) -> Option<u8> {
    (sw >> 8 == 0x61).then_some((sw & 0xFF) as u8)
}

/// For `6Cxx`: the correct `Le` the command must be re-issued with.
pub fn wrong_le(sw: u16) -> Option<u8> {
    (sw >> 8 == 0x6C).then_some((sw & 0xFF) as u8)
}

/// For `63Cx`: the number of retries remaining on a counter.
pub fn retries_remaining(sw: u16) -> Option<u8> {
    (sw & 0xFFF0 == 0x63C0).then_some((sw & 0x0F) as u8)
}
