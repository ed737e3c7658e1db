/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The RESP data model: replies as read from Redis, and commands as written
//! to it.

use std::str;

use bytes::{Bytes, BytesMut};

use crate::error::{self, Error};
use crate::protocol::codec::encode;

/// A single reply from Redis, owning its data.
///
/// It is cloneable to allow multiple copies to be delivered in certain
/// circumstances, e.g. multiple subscribers to the same topic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RespValue {
    /// An explicit nil, either a nil bulk string (`$-1`) or a nil array
    /// (`*-1`); Redis does not distinguish them on the caller side.
    Nil,

    /// Zero, one or more other `RespValue`s.
    Array(Vec<RespValue>),

    /// A bulk string.  In Redis terminology a string is a byte-array, so this
    /// is stored as a vector of `u8`s to allow clients to interpret the bytes
    /// as appropriate.
    BulkString(Vec<u8>),

    /// An error from the Redis server
    Error(String),

    /// An integer reply.  The textual bytes are carried as-is, the digits are
    /// validated during decoding but never parsed; use `FromResp` to convert
    /// to a numeric type on demand.
    Integer(Vec<u8>),

    SimpleString(String),
}

impl RespValue {
    pub(crate) fn into_result(self) -> Result<RespValue, Error> {
        match self {
            RespValue::Error(string) => Err(Error::Remote(string)),
            x => Ok(x),
        }
    }
}

/// A trait to be implemented for every type which can be read from a RESP
/// value.
///
/// Implementing this trait on a type means that type becomes a valid return
/// type for calls such as `send` on `client::PairedConnection`
pub trait FromResp: Sized {
    /// Return a `Result` containing either `Self` or `Error`.  Errors can
    /// occur due to either: a) the particular `RespValue` being incompatible
    /// with the required type, or b) a remote Redis error occuring.
    fn from_resp(resp: RespValue) -> Result<Self, Error> {
        Self::from_resp_int(resp.into_result()?)
    }

    fn from_resp_int(resp: RespValue) -> Result<Self, Error>;
}

impl FromResp for RespValue {
    fn from_resp_int(resp: RespValue) -> Result<RespValue, Error> {
        Ok(resp)
    }
}

impl FromResp for String {
    fn from_resp_int(resp: RespValue) -> Result<String, Error> {
        match resp {
            RespValue::BulkString(ref bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            RespValue::Integer(ref bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            RespValue::SimpleString(string) => Ok(string),
            _ => Err(error::resp("Cannot convert into a string", resp)),
        }
    }
}

impl FromResp for Vec<u8> {
    fn from_resp_int(resp: RespValue) -> Result<Vec<u8>, Error> {
        match resp {
            RespValue::BulkString(bytes) => Ok(bytes),
            RespValue::Integer(bytes) => Ok(bytes),
            _ => Err(error::resp("Not a bulk string", resp)),
        }
    }
}

impl FromResp for i64 {
    fn from_resp_int(resp: RespValue) -> Result<i64, Error> {
        match resp {
            RespValue::Integer(ref bytes) => match str::from_utf8(bytes) {
                Ok(string) => match string.parse() {
                    Ok(int) => Ok(int),
                    Err(_) => Err(error::resp("Not an integer", resp.clone())),
                },
                Err(_) => Err(error::resp("Not a valid integer string", resp.clone())),
            },
            _ => Err(error::resp("Cannot be converted into an i64", resp)),
        }
    }
}

macro_rules! impl_fromresp_integers {
    ($($int_ty:ident),* $(,)*) => {
        $(
            impl FromResp for $int_ty {
                fn from_resp_int(resp: RespValue) -> Result<Self, Error> {
                    i64::from_resp_int(resp).and_then(|x| {
                        // $int_ty::max_value() as i64 > 0 should be optimized out. It tests if
                        // the target integer type needs an "upper bounds" check
                        if x < ($int_ty::min_value() as i64)
                            || ($int_ty::max_value() as i64 > 0
                                && x > ($int_ty::max_value() as i64))
                        {
                            Err(error::resp(
                                concat!(
                                    "i64 value cannot be represented as ",
                                    stringify!($int_ty),
                                ),
                                RespValue::Integer(x.to_string().into_bytes()),
                            ))
                        } else {
                            Ok(x as $int_ty)
                        }
                    })
                }
            }
        )*
    };
}

impl_fromresp_integers!(isize, usize, i32, u32, u64);

impl FromResp for bool {
    fn from_resp_int(resp: RespValue) -> Result<bool, Error> {
        i64::from_resp_int(resp).and_then(|x| match x {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(error::resp(
                "i64 value cannot be represented as bool",
                RespValue::Integer(x.to_string().into_bytes()),
            )),
        })
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp_int(resp: RespValue) -> Result<Option<T>, Error> {
        match resp {
            RespValue::Nil => Ok(None),
            x => Ok(Some(T::from_resp_int(x)?)),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp_int(resp: RespValue) -> Result<Vec<T>, Error> {
        match resp {
            RespValue::Array(ary) => {
                let mut ar = Vec::with_capacity(ary.len());
                for value in ary {
                    ar.push(T::from_resp(value)?);
                }
                Ok(ar)
            }
            _ => Err(error::resp("Cannot be converted into a vector", resp)),
        }
    }
}

impl FromResp for () {
    fn from_resp_int(resp: RespValue) -> Result<(), Error> {
        match resp {
            RespValue::SimpleString(string) => match string.as_ref() {
                "OK" => Ok(()),
                _ => Err(Error::RESP(
                    format!("Unexpected value within SimpleString: {}", string),
                    None,
                )),
            },
            _ => Err(error::resp("Unexpected value", resp)),
        }
    }
}

/// One argument of a command.
///
/// Arguments always end up on the wire as bulk strings: integers are rendered
/// in their decimal form, nested sequences are flattened in order.  Floats
/// are representable so that they can be rejected with a meaningful error
/// when the command is encoded; callers that really mean to store one must
/// format it themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Bytes(Vec<u8>),
    Integer(i64),
    Float(f64),
    List(Vec<CommandArg>),
}

macro_rules! impl_commandarg_integers {
    ($($int_ty:ident),* $(,)*) => {
        $(
            impl From<$int_ty> for CommandArg {
                fn from(from: $int_ty) -> CommandArg {
                    CommandArg::Integer(from as i64)
                }
            }
        )*
    };
}

impl_commandarg_integers!(i8, i16, i32, i64, u8, u16, u32, usize);

impl From<f64> for CommandArg {
    fn from(from: f64) -> CommandArg {
        CommandArg::Float(from)
    }
}

impl From<f32> for CommandArg {
    fn from(from: f32) -> CommandArg {
        CommandArg::Float(from as f64)
    }
}

impl From<String> for CommandArg {
    fn from(from: String) -> CommandArg {
        CommandArg::Bytes(from.into_bytes())
    }
}

impl<'a> From<&'a String> for CommandArg {
    fn from(from: &'a String) -> CommandArg {
        CommandArg::Bytes(from.as_bytes().into())
    }
}

impl<'a> From<&'a str> for CommandArg {
    fn from(from: &'a str) -> CommandArg {
        CommandArg::Bytes(from.as_bytes().into())
    }
}

impl<'a> From<&'a [u8]> for CommandArg {
    fn from(from: &'a [u8]) -> CommandArg {
        CommandArg::Bytes(from.to_vec())
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(from: Vec<u8>) -> CommandArg {
        CommandArg::Bytes(from)
    }
}

impl From<Vec<CommandArg>> for CommandArg {
    fn from(from: Vec<CommandArg>) -> CommandArg {
        CommandArg::List(from)
    }
}

impl<'a> From<Vec<&'a str>> for CommandArg {
    fn from(from: Vec<&'a str>) -> CommandArg {
        CommandArg::List(from.into_iter().map(|s| s.into()).collect())
    }
}

impl From<Vec<String>> for CommandArg {
    fn from(from: Vec<String>) -> CommandArg {
        CommandArg::List(from.into_iter().map(|s| s.into()).collect())
    }
}

/// A command to be sent to Redis, an ordered sequence of arguments.
///
/// Usually constructed with the `cmd!` macro.  The encoded form is always a
/// RESP multibulk frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Command(Vec<CommandArg>);

impl Command {
    pub fn from_args(args: Vec<CommandArg>) -> Self {
        Command(args)
    }

    /// Append a single argument, useful when a command is assembled
    /// conditionally, e.g. an optional AUTH username.
    pub fn push<T: Into<CommandArg>>(&mut self, arg: T) {
        self.0.push(arg.into());
    }

    /// Append any number of arguments, useful for commands with variable
    /// numbers of arguments, e.g. RPUSH
    pub fn append<T>(mut self, other: impl IntoIterator<Item = T>) -> Self
    where
        T: Into<CommandArg>,
    {
        self.0.extend(other.into_iter().map(|t| t.into()));
        self
    }

    /// Encode onto the end of `buf`.  Fails, writing nothing, if any argument
    /// is a float.
    pub(crate) fn encode_into(self, buf: &mut BytesMut) -> Result<(), Error> {
        let mut flat = Vec::with_capacity(self.0.len());
        flatten_into(self.0, &mut flat)?;
        encode::multibulk(flat, buf);
        Ok(())
    }

    /// The full wire form of the command.
    pub fn to_wire_bytes(self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn flatten_into(args: Vec<CommandArg>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
    for arg in args {
        match arg {
            CommandArg::Bytes(bytes) => out.push(bytes),
            CommandArg::Integer(i) => out.push(i.to_string().into_bytes()),
            CommandArg::Float(f) => return Err(Error::CannotStoreFloats(f)),
            CommandArg::List(list) => flatten_into(list, out)?,
        }
    }
    Ok(())
}

/// Macro to create a command, e.g. `cmd!["SET", "key_name", value]`.
/// Elements can be any type, or a mixture of types, that satisfy
/// `Into<CommandArg>`.
///
/// As a general rule, if a value is moved, the data can be deconstructed (if
/// appropriate, e.g. String) and the raw data moved into the corresponding
/// `CommandArg`.  If a reference is provided, the data will be copied
/// instead.
#[macro_export]
macro_rules! cmd {
    ($($e:expr),* $(,)?) => {
        {
            $crate::protocol::resp::Command::from_args(vec![
                $(
                    $e.into(),
                )*
            ])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FromResp, RespValue};

    #[test]
    fn test_integer_overflow() {
        let resp_object = RespValue::Integer(i64::max_value().to_string().into_bytes());
        let res = i32::from_resp(resp_object);
        assert!(res.is_err());
    }

    #[test]
    fn test_integer_underflow() {
        let resp_object = RespValue::Integer(b"-2".to_vec());
        let res = u64::from_resp(resp_object);
        assert!(res.is_err());
    }

    #[test]
    fn test_integer_conversion() {
        let resp_object = RespValue::Integer(b"50".to_vec());
        assert_eq!(u32::from_resp(resp_object).unwrap(), 50);
    }

    #[test]
    fn test_string_conversion() {
        let resp_object = RespValue::Integer(b"50".to_vec());
        assert_eq!(String::from_resp(resp_object).unwrap(), "50");
    }

    #[test]
    fn test_error_reply_becomes_error() {
        let resp_object = RespValue::Error("WRONGTYPE wrong kind of value".to_owned());
        let res = String::from_resp(resp_object);
        assert!(res.is_err());
    }

    #[test]
    fn test_unit_requires_ok() {
        assert!(<()>::from_resp(RespValue::SimpleString("OK".to_owned())).is_ok());
        assert!(<()>::from_resp(RespValue::SimpleString("QUEUED".to_owned())).is_err());
    }
}
