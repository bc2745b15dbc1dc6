// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use std::time::Duration;
use tagrpc::{ClientCredentials, Context, Hub};

#[derive(Parser)]
#[command(about = "Say hello!")]
struct Flags {
    /// Sets the server address to connect to, as host:port.
    #[arg(long)]
    server_addr: String,
    /// Sets the name to say hello to.
    #[arg(long)]
    name: String,
    /// PEM root certificate to authenticate the server with. Connects in plaintext if omitted.
    #[arg(long)]
    root_cert: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    service::init_tracing()?;

    let root = flags.root_cert.map(std::fs::read_to_string).transpose()?;
    let credentials = ClientCredentials::from_pem(root.as_deref(), None, None)?;

    let hub = Hub::default();
    let client = hub.client("greeter", &flags.server_addr, credentials)?;

    let (tx, rx) = flume::bounded(1);
    let ctx = Context::default().with_timeout(Duration::from_secs(5));
    client.unary(
        service::HELLO,
        ctx,
        &flags.name,
        move |result, greeting: Option<String>| {
            let _ = tx.send((result, greeting));
        },
    );
    let (result, greeting) = rx.recv()?;
    match greeting {
        Some(greeting) => tracing::info!("{greeting}"),
        None => tracing::warn!("{}", result.status()),
    }

    hub.shutdown();
    Ok(())
}
