//! Messages carried between pipeline stages.
//!
//! The pipeline moves opaque values: raw [`ByteBuf`]s straight off the
//! socket, or arbitrary user objects produced by decoders further up the
//! chain. Reference counting follows the payload: buffer messages forward
//! retain/release to the buffer, user messages ignore both.

use std::any::Any;
use std::fmt;

use crate::buffer::ByteBuf;
use crate::error::Result;

/// A value traveling through a channel pipeline.
pub enum Message {
    /// A reference-counted byte buffer.
    Buf(ByteBuf),
    /// A decoded user object.
    User(Box<dyn Any + Send>),
}

impl Message {
    /// Wrap a user object.
    pub fn user<T: Any + Send>(value: T) -> Self {
        Self::User(Box::new(value))
    }

    #[must_use]
    pub fn as_buf(&self) -> Option<&ByteBuf> {
        match self {
            Self::Buf(buf) => Some(buf),
            Self::User(_) => None,
        }
    }

    /// Check the payload type without consuming the message.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Buf(buf) => (buf as &dyn Any).downcast_ref::<T>(),
            Self::User(boxed) => boxed.downcast_ref::<T>(),
        }
    }

    /// Retain the payload if it is reference-counted; no-op otherwise.
    pub fn retain(&self) -> Result<()> {
        match self {
            Self::Buf(buf) => buf.retain(),
            Self::User(_) => Ok(()),
        }
    }

    /// Release the payload if it is reference-counted; no-op otherwise.
    ///
    /// Returns `true` when this call deallocated a buffer.
    pub fn release(&self) -> Result<bool> {
        match self {
            Self::Buf(buf) => buf.release(),
            Self::User(_) => Ok(false),
        }
    }

    /// Byte size used for outbound accounting. User objects count as
    /// zero until an encoder turns them into bytes.
    #[must_use]
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Buf(buf) => buf.readable_bytes(),
            Self::User(_) => 0,
        }
    }
}

impl From<ByteBuf> for Message {
    fn from(buf: ByteBuf) -> Self {
        Self::Buf(buf)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buf(buf) => f.debug_tuple("Message::Buf").field(buf).finish(),
            Self::User(_) => f.write_str("Message::User(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BufAllocator, UnpooledAllocator};

    #[test]
    fn test_buf_message_forwards_refcount() {
        let buf = UnpooledAllocator.heap_buffer(16);
        let msg = Message::from(buf.clone());
        msg.retain().unwrap();
        assert_eq!(buf.ref_cnt(), 2);
        assert!(!msg.release().unwrap());
        assert!(msg.release().unwrap());
        assert_eq!(buf.ref_cnt(), 0);
    }

    #[test]
    fn test_user_message_downcast() {
        let msg = Message::user(String::from("decoded"));
        assert!(msg.is::<String>());
        assert!(!msg.is::<u32>());
        assert_eq!(msg.downcast_ref::<String>().unwrap(), "decoded");
        assert_eq!(msg.size_hint(), 0);
        assert!(!msg.release().unwrap());
    }

    #[test]
    fn test_buf_downcast_as_bytebuf() {
        let buf = UnpooledAllocator.heap_buffer(4);
        buf.write_slice(b"ab").unwrap();
        let msg = Message::from(buf);
        assert!(msg.is::<ByteBuf>());
        assert_eq!(msg.size_hint(), 2);
    }
}
