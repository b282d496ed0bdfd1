//! # Rowsync Engine
//!
//! Synchronizes rows of local SQLite tables with a remote object store
//! over an authenticated, end-to-end encrypted websocket channel.
//!
//! This crate provides:
//! - The engine state machine ([`Engine`])
//! - The remote connector with its socket and settings contracts
//! - The dirty-table scheduler
//! - The cloud transformer (AES-256-GCM envelope with keyed tags)
//! - The authenticator contract and the error taxonomy
//!
//! Everything runs on one cooperative task: the embedder calls
//! [`Engine::pump`] from its loop and the engine sequences the watcher,
//! connector and transformer from there. Conflicts resolve by
//! last-writer-wins on the record's `modified` timestamp.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod connector;
mod engine;
mod error;
mod registry;
mod scheduler;
mod transformer;

pub use auth::{AuthError, AuthEvent, Authenticator, SignIn, StaticAuthenticator};
pub use config::{EngineConfig, ReconnectBackoff};
pub use connector::{
    ConnectorEvent, ConnectorState, MemorySettings, MockServer, MockSocket, MockSocketFactory,
    RemoteConnector, SettingsStore, Socket, SocketFactory,
};
pub use engine::{Engine, EngineState, EngineStats, SyncPhase};
pub use error::{ErrorEvent, ErrorType, SyncError, SyncResult};
pub use registry::{SetupRegistry, DEFAULT_SETUP};
pub use scheduler::{DirtyTables, SyncSide};
pub use transformer::{
    CloudTransformer, KeyProvider, PlainCloudTransformer, StaticKeyProvider,
    SymmetricCloudTransformer, SyncKey, TransformError, KEY_SIZE, NONCE_SIZE,
};
