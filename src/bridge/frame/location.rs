//! Interpreted frame location and its opaque token.
//!
//! Token layout, little endian:
//!
//! ```text
//! [file len: u16][file: utf8][has function: u8]([function len: u16][function: utf8])?
//! [line: u32][module tag: u8]([module relative address: u64])?
//! ```
//!
//! Module tag is 0 when there is no native back-reference, otherwise a [`KnownModule`] tag.

use crate::bridge::address::GlobalAddress;
use crate::bridge::error::Error;
use crate::bridge::error::Error::TokenFormat;
use crate::bridge::runtime::{KnownModule, NativeAddress};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

/// Position in interpreted code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
    /// Native code executing this location, used when no interpreter state is at hand.
    pub native_address: Option<NativeAddress>,
}

fn put_str(buf: &mut BytesMut, s: &str, what: &'static str) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_| TokenFormat(what))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], what: &'static str) -> Result<String, Error> {
    if buf.remaining() < 2 {
        return Err(TokenFormat(what));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(TokenFormat(what));
    }
    let s = String::from_utf8(buf[..len].to_vec())?;
    buf.advance(len);
    Ok(s)
}

impl SourceLocation {
    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(self.file.len() + 32);
        put_str(&mut buf, &self.file, "file name too long")?;
        match &self.function {
            None => buf.put_u8(0),
            Some(function) => {
                buf.put_u8(1);
                put_str(&mut buf, function, "function name too long")?;
            }
        }
        buf.put_u32_le(self.line);
        match self.native_address {
            None => buf.put_u8(0),
            Some(native) => {
                buf.put_u8(native.module.tag());
                buf.put_u64_le(native.offset.as_u64());
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(token: &[u8]) -> Result<Self, Error> {
        let mut buf = token;
        let file = get_str(&mut buf, "file name")?;

        if !buf.has_remaining() {
            return Err(TokenFormat("function flag"));
        }
        let function = match buf.get_u8() {
            0 => None,
            1 => Some(get_str(&mut buf, "function name")?),
            _ => return Err(TokenFormat("function flag")),
        };

        if buf.remaining() < 4 + 1 {
            return Err(TokenFormat("line"));
        }
        let line = buf.get_u32_le();

        let native_address = match buf.get_u8() {
            0 => None,
            tag => {
                let module = KnownModule::from_tag(tag).ok_or(TokenFormat("module tag"))?;
                if buf.remaining() < 8 {
                    return Err(TokenFormat("native address"));
                }
                Some(NativeAddress {
                    module,
                    offset: GlobalAddress::from(buf.get_u64_le()),
                })
            }
        };

        if buf.has_remaining() {
            return Err(TokenFormat("trailing bytes"));
        }
        Ok(Self {
            file,
            line,
            function,
            native_address,
        })
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{function} ({}:{})", self.file, self.line),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}
