// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use tagrpc::{server, Hub, ServerCredentials};

#[derive(Parser)]
#[command(about = "Say hello!")]
struct Flags {
    /// Sets the port number to listen on.
    #[arg(long)]
    port: u16,
    /// PEM certificate chain. Serves plaintext if omitted.
    #[arg(long, requires = "key")]
    cert: Option<std::path::PathBuf>,
    /// PEM private key of the certificate.
    #[arg(long, requires = "cert")]
    key: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    service::init_tracing()?;

    let cert = flags.cert.map(std::fs::read_to_string).transpose()?;
    let key = flags.key.map(std::fs::read_to_string).transpose()?;
    let credentials = ServerCredentials::from_pem(cert.as_deref(), key.as_deref(), None)?;

    let hub = Hub::default();
    hub.register_service(service::SERVICE, service::hello);
    let server_addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), flags.port);
    let local_addr = hub.start_server(
        &server_addr.to_string(),
        credentials,
        server::Config::default(),
    )?;
    tracing::info!(%local_addr, "Serving {}", service::SERVICE);

    // Calls are served on the hub's own threads.
    loop {
        std::thread::park();
    }
}
