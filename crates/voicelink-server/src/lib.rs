//! Server side of voicelink.
//!
//! A [`Server`] accepts WebSocket connections, greets each client with a
//! `status` message and hands every frame to a [`Router`], which answers
//! pings and routes requests to the configured [`Collaborators`].
//!
//! ```no_run
//! # use voicelink_server::{Collaborators, HandlerError, Inference, Server};
//! # use voicelink_core::{ServerConfig, Turn};
//! struct Parrot;
//!
//! #[async_trait::async_trait]
//! impl Inference for Parrot {
//!     async fn infer(&self, prompt: &str, _: Option<&str>, _: &[Turn]) -> Result<String, HandlerError> {
//!         Ok(prompt.to_string())
//!     }
//! }
//!
//! # async fn run() -> Result<(), voicelink_server::ServerError> {
//! let server = Server::bind(ServerConfig::default(), Collaborators::new(Parrot)).await?;
//! server.run().await
//! # }
//! ```

mod collaborators;
mod router;
mod server;

pub use collaborators::{
    Collaborators, HandlerError, Inference, SpeakerVerifier, SpeechRecognizer, SpeechSynthesizer,
};
pub use router::Router;
pub use server::{ConnectionInfo, LiveConnections, Server, ServerError};
