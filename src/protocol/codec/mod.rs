/*
 * Copyright 2020 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

mod decode;
pub(crate) mod encode;

use bytes::{Bytes, BytesMut};

use tokio_util::codec::Encoder;

use crate::error::Error;

pub(crate) use decode::RespCodec;

/// Frames are encoded by the request layer (so that encoding errors surface
/// synchronously to the submitter); by the time they reach the codec they are
/// opaque bytes to append to the write buffer.
impl Encoder<Bytes> for RespCodec {
    type Error = Error;

    fn encode(&mut self, frame: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.extend_from_slice(&frame);
        Ok(())
    }
}
