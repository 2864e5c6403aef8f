//! `tasksyncd server` - run the sync server

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{keys, DEFAULT_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::server::Pipeline;
use crate::transport::{Server, TlsOptions};

pub fn run(data: &Path) -> Result<()> {
    let repo = Repository::open(data)?;
    let config = repo.config();

    // Only strict mutual authentication is implemented.
    let trust = config.get_or(keys::TRUST, "strict");
    if trust != "strict" {
        return Err(Error::InvalidConfig(format!(
            "trust: only \"strict\" is supported, got {trust:?}"
        )));
    }

    let options = TlsOptions {
        bind: required(config.get(keys::SERVER), keys::SERVER)?.to_string(),
        server_cert: required(config.get(keys::SERVER_CERT), keys::SERVER_CERT)?.into(),
        server_key: required(config.get(keys::SERVER_KEY), keys::SERVER_KEY)?.into(),
        ca_cert: required(config.get(keys::CA_CERT), keys::CA_CERT)?.into(),
    };
    let queue_size = config
        .get_usize(keys::QUEUE_SIZE)?
        .unwrap_or(DEFAULT_QUEUE_SIZE);

    let pipeline = Arc::new(Pipeline::new(repo));
    let _server = Server::serve(&options, queue_size, move |conn| {
        pipeline.handle(conn);
    })?;

    info!("server running; interrupt to stop");

    // Signal-driven shutdown stays outside the core: the process parks
    // here until it is killed. Server::close drains workers on drop.
    loop {
        std::thread::park();
    }
}

fn required<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::InvalidConfig(format!("missing required key: {key}")))
}
