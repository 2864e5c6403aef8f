//! Shared test fixtures: a temp repository with one org and user, plus
//! helpers for building framed sync requests and reading responses.

use std::io::{Cursor, Read, Write};

use tempfile::TempDir;

use tasksyncd::message::Message;
use tasksyncd::repository::{Repository, User};
use tasksyncd::server::Pipeline;

pub struct TestRepo {
    // Held for its Drop: the repository lives inside this directory.
    _dir: TempDir,
    pub repo: Repository,
    pub user: User,
}

impl TestRepo {
    /// A fresh repository with org `Public` and user `alice`.
    pub fn init() -> Self {
        let dir = TempDir::new().expect("failed to create tempdir");
        let repo = Repository::create(dir.path()).expect("repository create");
        repo.new_org("Public").expect("create org");
        let user = repo.add_user("Public", "alice").expect("add user");
        Self {
            _dir: dir,
            repo,
            user,
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.repo.clone())
    }

    /// The user's transaction log, as lines.
    pub fn log_lines(&self) -> Vec<String> {
        self.repo.read(&self.user).expect("read log")
    }

    /// Seed the transaction log directly.
    pub fn seed_log(&self, lines: &[&str]) {
        let lines: Vec<String> = lines.iter().map(|line| line.to_string()).collect();
        self.repo.append(&self.user, &lines).expect("seed log");
    }

    /// A framed `sync` request for this repo's user.
    pub fn sync_request(&self, payload: &str) -> Vec<u8> {
        let mut msg = Message::default();
        msg.set("type", "sync");
        msg.set("protocol", "v1");
        msg.set("org", self.user.org.clone());
        msg.set("user", self.user.name.clone());
        msg.set("key", self.user.key.clone());
        msg.set("client", "tasksyncd-tests 1.0");
        msg.payload = payload.to_string();
        msg.serialize()
    }
}

/// An in-memory connection: a prepared request on the read side, captured
/// output on the write side.
pub struct TestConn {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl TestConn {
    pub fn new(request: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(request),
            output: Vec::new(),
        }
    }

    pub fn response(&self) -> Message {
        Message::read(&mut Cursor::new(self.output.clone()), 1 << 20).expect("parse response")
    }
}

impl Read for TestConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for TestConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run one framed request through a pipeline and return the response.
pub fn exchange(pipeline: &Pipeline, request: Vec<u8>) -> Message {
    let mut conn = TestConn::new(request);
    pipeline.handle(&mut conn);
    conn.response()
}
