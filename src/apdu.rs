//! APDU command and response framing according to ISO/IEC 7816-4.

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Status word returned by the card (SW1 SW2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord {
    /// First status byte
    pub sw1: u8,
    /// Second status byte
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Combined 16-bit status value
    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    /// Whether this status word indicates success (9000)
    pub const fn is_success(self) -> bool {
        self.to_u16() == crate::constants::status::SUCCESS
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Maximum data length for a short APDU (one-byte Lc)
const MAX_COMMAND_DATA_LEN: usize = 255;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected response length (optional, raw Le byte)
    pub le: Option<u8>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: None,
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// Command payload data, empty if absent
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Serialize to raw APDU bytes.
    ///
    /// Only short APDUs are produced; data longer than one Lc byte can
    /// carry is rejected rather than truncated.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        if data_len > MAX_COMMAND_DATA_LEN {
            return Err(Error::InvalidLength {
                expected: MAX_COMMAND_DATA_LEN,
                actual: data_len,
            });
        }

        let mut buffer = BytesMut::with_capacity(4 + if data_len > 0 { 1 + data_len } else { 0 } + 1);

        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if let Some(data) = &self.data {
            buffer.put_u8(data.len() as u8);
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            buffer.put_u8(le);
        }

        Ok(buffer.freeze())
    }

    /// Parse a command from raw bytes, discriminating the ISO 7816-4 cases:
    /// header only, trailing Le, Lc plus data, and Lc plus data plus Le.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidLength {
                expected: 4,
                actual: data.len(),
            });
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);

        if data.len() == 5 {
            // Only Le present, no data
            command.le = Some(data[4]);
        } else if data.len() > 5 {
            let lc = data[4] as usize;
            if lc > 0 && data.len() >= 5 + lc {
                command.data = Some(Bytes::copy_from_slice(&data[5..5 + lc]));
            }
            if data.len() == 5 + lc + 1 {
                command.le = Some(data[5 + lc]);
            } else if data.len() != 5 + lc {
                return Err(Error::InvalidLength {
                    expected: 5 + lc,
                    actual: data.len(),
                });
            }
        }

        Ok(command)
    }
}

/// APDU response: optional payload followed by a status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Option<Bytes>,
    status: StatusWord,
}

impl Response {
    /// Create a response from a payload and status word
    pub const fn new(payload: Option<Bytes>, status: StatusWord) -> Self {
        Self { payload, status }
    }

    /// Create a success response with the given payload
    pub const fn success(payload: Option<Bytes>) -> Self {
        Self {
            payload,
            status: StatusWord::new(0x90, 0x00),
        }
    }

    /// Parse a response from raw bytes (payload followed by SW1 SW2)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::InvalidLength {
                expected: 2,
                actual: data.len(),
            });
        }

        let (body, trailer) = data.split_at(data.len() - 2);
        let payload = if body.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(body))
        };

        Ok(Self {
            payload,
            status: StatusWord::new(trailer[0], trailer[1]),
        })
    }

    /// Serialize to raw bytes (payload followed by SW1 SW2)
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer =
            BytesMut::with_capacity(self.payload.as_ref().map_or(0, |p| p.len()) + 2);
        if let Some(payload) = &self.payload {
            buffer.put_slice(payload);
        }
        buffer.put_u8(self.status.sw1);
        buffer.put_u8(self.status.sw2);
        buffer.freeze()
    }

    /// The response payload, if any
    pub const fn payload(&self) -> &Option<Bytes> {
        &self.payload
    }

    /// The status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Whether the status word indicates success
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
