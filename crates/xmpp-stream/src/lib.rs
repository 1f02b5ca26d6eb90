//! # xmpp-stream
//!
//! Client-side XMPP stream core.
//!
//! ## Architecture
//!
//! - **Resolver**: SRV discovery of host/port candidates with a shared cache
//! - **Parser**: incremental XML framing of the inbound byte stream
//! - **Stream**: one reader task per connection dispatching stanzas to
//!   extensions and to predicate-based waiters
//! - **Negotiation**: STARTTLS, SASL, resource binding, legacy session and
//!   stream management, run in order after the stream opens
//!
//! ## Example
//!
//! ```no_run
//! use xmpp_stream::{connect, ConnectOptions, Credentials};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::parse("bot@example.com/ops", "secret")?;
//! let stream = connect(ConnectOptions::new(credentials)).await?;
//! println!("bound as {}", stream.jid());
//! stream.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod negotiation;
pub mod ns;
pub mod parser;
pub mod predicate;
pub mod resolver;
pub mod stanza;
pub mod stream;
pub mod telemetry;

mod error;

pub use client::{connect, connect_over, ConnectOptions, Credentials};
pub use config::{ClientConfig, ConfigError};
pub use error::{ConnectError, Error, Result};
pub use negotiation::{Negotiator, SessionPolicy, StreamManagementOptions, TlsPolicy};
pub use predicate::Predicate;
pub use resolver::{Endpoint, EndpointCache, ResolveError, Resolver};
pub use stanza::{Iq, IqType, Message, Presence, Stanza, StanzaError};
pub use stream::{Extension, Extensions, Stream, StreamCallbacks, StreamOptions};
