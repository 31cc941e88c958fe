// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use cyphal_udp_transport::{
    Transport, TransportConfig,
    address::Priority,
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    session::specifier::DataSpecifier,
};
use tracing::info;

const HEARTBEAT_SUBJECT_ID: u16 = 7509;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("docker/config.transport.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let transport_config =
        TransportConfig::from_cfg(&cfg).context("invalid transport configuration")?;
    let transport = Transport::new(transport_config).context("failed to construct transport")?;
    transport.initialize().context("failed to initialize transport")?;
    info!(node_id = %transport.local_node_id(), "transport initialized");

    let heartbeat = DataSpecifier::message(HEARTBEAT_SUBJECT_ID).context("invalid subject-id")?;
    let output = transport
        .get_output_session(heartbeat, None)
        .context("failed to open heartbeat output session")?;
    let input = transport
        .get_input_session(heartbeat, None)
        .context("failed to open heartbeat input session")?;

    for tick in 0u64.. {
        let payload = tick.to_le_bytes();
        let outcome = output
            .send(
                &payload,
                Priority::Nominal,
                std::time::Instant::now() + Duration::from_secs(1),
                1024,
            )
            .context("heartbeat send failed")?;
        info!(tick, ?outcome, "published heartbeat");

        transport
            .run_for(Duration::from_millis(200))
            .await
            .context("run_for failed")?;

        while let Some(transfer) = input.receive() {
            info!(
                source_node_id = ?transfer.source_node_id,
                transfer_id = transfer.transfer_id,
                payload_len = transfer.payload.len(),
                "observed heartbeat"
            );
        }

        if tick >= 4 {
            break;
        }
    }

    let stats = transport.stats();
    info!(?stats, "final transport statistics");
    transport.close();
    Ok(())
}
