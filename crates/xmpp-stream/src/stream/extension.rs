//! Pluggable protocol extensions.
//!
//! An extension hooks into inbound and outbound stanza flow and runs once the
//! session is established. Extensions are registered before the stream is
//! created and are looked up afterwards by type through
//! [`Stream::extension`](super::Stream::extension).

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;

use super::Stream;
use crate::stanza::Stanza;
use crate::Error;

/// A capability unit plugged into a [`Stream`].
///
/// Hooks run on the stream's reader task, one stanza at a time. `on_stanza`
/// may send, but must not wait for further inbound stanzas: those can only
/// be dispatched once the hook returns.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Name used in logs and registration errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Names this extension provides to the rest of the stream. Must not
    /// overlap with any other registered extension.
    fn exports(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Called for every inbound stanza, before waiters see it.
    async fn on_stanza(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a stanza has been written to the transport.
    fn on_send(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once negotiation has completed.
    async fn post_session(&self, _stream: &Stream) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Registered {
    type_id: TypeId,
    name: String,
    exports: Vec<&'static str>,
    extension: Arc<dyn Extension>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Ordered set of extensions with unique identities and export names.
#[derive(Default)]
pub struct Extensions {
    entries: Vec<Registered>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extension. Registering the same type twice, or an export
    /// name already claimed by another extension, is an error.
    pub fn register<T: Extension>(&mut self, extension: T) -> Result<&mut Self, Error> {
        let name = extension.name().to_string();
        let type_id = TypeId::of::<T>();

        if self.entries.iter().any(|e| e.type_id == type_id) {
            return Err(Error::DuplicateExtension {
                extension: name.clone(),
                name,
            });
        }

        let exports = extension.exports();
        for (i, export) in exports.iter().enumerate() {
            if exports[..i].contains(export) {
                return Err(Error::DuplicateExtension {
                    extension: name,
                    name: export.to_string(),
                });
            }
            if let Some(owner) = self.entries.iter().find(|e| e.exports.contains(export)) {
                tracing::debug!(owner = %owner.name, export, "Export name already claimed");
                return Err(Error::DuplicateExtension {
                    extension: name,
                    name: export.to_string(),
                });
            }
        }

        let extension = Arc::new(extension);
        self.entries.push(Registered {
            type_id,
            name,
            exports,
            any: extension.clone(),
            extension,
        });
        Ok(self)
    }

    /// Builder form of [`Extensions::register`].
    pub fn with<T: Extension>(mut self, extension: T) -> Result<Self, Error> {
        self.register(extension)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered extension names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// The registered extension of type `T`.
    pub fn get<T: Extension>(&self) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|e| e.type_id == TypeId::of::<T>())
            .and_then(|e| e.any.clone().downcast::<T>().ok())
    }

    /// Which extension exports `name`.
    pub fn provider_of(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.exports.iter().any(|export| *export == name))
            .map(|e| e.name.as_str())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.entries.iter().map(|e| &e.extension)
    }
}
