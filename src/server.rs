//! Request pipeline
//!
//! One connection carries exactly one framed request and one framed
//! response: frame → credentials → protocol check → dispatch → merge →
//! frame response. Every failure after the frame is read still produces a
//! structured response.
//!
//! Concurrent syncs for the same user would race the read-merge-append
//! cycle (two workers computing against the same branch point, then
//! racing the rename), so the pipeline holds a per-user exclusive lock
//! for the whole cycle. Distinct users proceed in parallel. taskd itself
//! takes no such lock and is racy here; serializing is a deliberate
//! deviation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info};

use crate::config::DEFAULT_REQUEST_LIMIT;
use crate::error::{Error, Result};
use crate::message::{status_text, Message};
use crate::repository::Repository;
use crate::sync;

/// Process-local registry of per-user mutexes, keyed by `(org, user key)`.
#[derive(Debug, Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the lock for one user. Callers lock the returned
    /// mutex for the duration of read → merge → append.
    pub fn for_user(&self, org: &str, key: &str) -> Arc<Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(format!("{org}/{key}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The request pipeline, shared across workers.
pub struct Pipeline {
    repo: Repository,
    locks: UserLocks,
    request_limit: usize,
}

impl Pipeline {
    pub fn new(repo: Repository) -> Self {
        let request_limit = repo
            .config()
            .get_usize(crate::config::keys::REQUEST_LIMIT)
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_REQUEST_LIMIT);
        Self {
            repo,
            locks: UserLocks::new(),
            request_limit,
        }
    }

    /// Handle one client connection: read one request, write one response.
    pub fn handle(&self, stream: &mut (impl Read + Write)) {
        let response = match Message::read(stream, self.request_limit) {
            Ok(request) => self.dispatch(&request),
            Err(err) => {
                error!(%err, "error parsing request");
                Message::error_response(&err)
            }
        };

        if let Err(err) = response.write(stream) {
            error!(%err, "error sending response");
        }
    }

    fn dispatch(&self, request: &Message) -> Message {
        match self.process(request) {
            Ok(response) => response,
            Err(err) => Message::error_response(&err),
        }
    }

    fn process(&self, request: &Message) -> Result<Message> {
        let user = self.repo.authenticate(
            request.get("org"),
            request.get("user"),
            request.get("key"),
        )?;

        if request.get("protocol") != "v1" {
            return Err(Error::UnsupportedProtocol);
        }

        match request.get("type") {
            "sync" => {
                info!(org = %user.org, user = %user.name, client = %request.get("client"), "sync request");

                let lock = self.locks.for_user(&user.org, &user.key);
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

                let result = sync::execute(&self.repo, &user, &request.payload)?;

                let mut response = Message::response(result.code, status_text(result.code));
                response.payload = result.payload;
                Ok(response)
            }
            other => Err(Error::Malformed(format!("unknown message type: {other:?}"))),
        }
    }
}
