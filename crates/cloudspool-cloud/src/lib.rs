// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloudspool cloud side: OAuth credentials, push notification session, and
// the cloud print REST client.

pub mod api;
pub mod credentials;
pub mod push;
pub mod rest;
pub mod session;

pub use api::{CloudPrint, CloudPrinter, QueuedJob};
pub use credentials::{CredentialStore, OAuthConfig, TokenSource};
pub use push::{PushEvent, PushSession, PushSessionHandle, PushTransport, WsTransport};
pub use rest::{CloudClient, build_http_client};
pub use session::{KeepaliveConfig, SessionState};
