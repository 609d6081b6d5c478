//! Type registry for the type-erased `Packed` envelope.
//!
//! Frame layout: `[PACKED(4)] [type_id(4)] [bincode body...]`.
//!
//! Types are registered once at startup with an explicit id and a handler.
//! Decoding never panics; a bad body or an unregistered id is an `Err` the
//! dispatch loop logs before dropping the message.

use crate::core::wire::{WireReader, WireWriter};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::MessageContext;
use crate::protocol::message::PACKED;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// A message type that travels inside the `Packed` envelope.
pub trait PackedMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Wire id, unique within one registry.
    const TYPE_ID: u32;
}

type PackedHandlerFn =
    dyn Fn(&MessageContext, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static;

struct Entry {
    type_name: &'static str,
    handler: Box<PackedHandlerFn>,
}

/// Maps packed type ids to a decoder and handler.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<u32, Entry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` with the handler invoked for every received instance.
    ///
    /// A returned frame is sent back to the source.
    pub fn register<T, F>(&mut self, handler: F) -> Result<()>
    where
        T: PackedMessage,
        F: Fn(&MessageContext, T) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        if let Some(existing) = self.entries.get(&T::TYPE_ID) {
            return Err(ProtocolError::Custom(format!(
                "Packed type id {} already registered to {}",
                T::TYPE_ID,
                existing.type_name
            )));
        }

        let decode_and_handle =
            move |ctx: &MessageContext, body: &[u8]| -> Result<Option<Vec<u8>>> {
                let value: T = bincode::deserialize(body)?;
                handler(ctx, value)
            };

        self.entries.insert(
            T::TYPE_ID,
            Entry {
                type_name: std::any::type_name::<T>(),
                handler: Box::new(decode_and_handle),
            },
        );
        debug!(
            type_id = T::TYPE_ID,
            type_name = std::any::type_name::<T>(),
            "Registered packed type"
        );
        Ok(())
    }

    pub fn contains(&self, type_id: u32) -> bool {
        self.entries.contains_key(&type_id)
    }

    pub fn type_name(&self, type_id: u32) -> Option<&'static str> {
        self.entries.get(&type_id).map(|entry| entry.type_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode `value` as a complete `Packed` frame.
    pub fn encode<T: PackedMessage>(value: &T) -> Result<Vec<u8>> {
        let body = bincode::serialize(value)?;
        let mut writer = WireWriter::with_capacity(8 + body.len());
        writer.put_u32(PACKED).put_u32(T::TYPE_ID).put_slice(&body);
        Ok(writer.finish())
    }

    /// Decode a complete `Packed` frame as `T`.
    pub fn decode<T: PackedMessage>(frame: &[u8]) -> Result<T> {
        let mut reader = WireReader::new(frame);
        let discriminator = reader.read_u32()?;
        if discriminator != PACKED {
            return Err(ProtocolError::DecodeError(format!(
                "Expected packed frame, found discriminator {discriminator}"
            )));
        }
        let type_id = reader.read_u32()?;
        if type_id != T::TYPE_ID {
            return Err(ProtocolError::DecodeError(format!(
                "Expected packed type {}, found {}",
                T::TYPE_ID,
                type_id
            )));
        }
        Ok(bincode::deserialize(reader.rest())?)
    }

    /// Decode `body` as the type registered under `type_id` and run its handler.
    pub fn dispatch(
        &self,
        type_id: u32,
        ctx: &MessageContext,
        body: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let entry = self
            .entries
            .get(&type_id)
            .ok_or(ProtocolError::UnknownPackedType(type_id))?;
        (entry.handler)(ctx, body)
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.type_name))
            .collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("types", &names)
            .finish()
    }
}
