// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Read-only, non-fatal observability counters (SPEC_FULL.md §3.9). These
//! never influence protocol decisions; spec §7 explicitly says reassembly
//! errors are "statistics only".

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub header_crc_failures: AtomicU64,
    pub transfer_crc_failures: AtomicU64,
    pub transfer_id_regressions: AtomicU64,
    pub out_of_order_frames: AtomicU64,
    pub reassembly_timeouts: AtomicU64,
    pub duplicate_transfers_dropped: AtomicU64,
    pub tx_items_expired: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> Stats {
        Stats {
            header_crc_failures: self.header_crc_failures.load(Ordering::Relaxed),
            transfer_crc_failures: self.transfer_crc_failures.load(Ordering::Relaxed),
            transfer_id_regressions: self.transfer_id_regressions.load(Ordering::Relaxed),
            out_of_order_frames: self.out_of_order_frames.load(Ordering::Relaxed),
            reassembly_timeouts: self.reassembly_timeouts.load(Ordering::Relaxed),
            duplicate_transfers_dropped: self
                .duplicate_transfers_dropped
                .load(Ordering::Relaxed),
            tx_items_expired: self.tx_items_expired.load(Ordering::Relaxed),
        }
    }

    pub fn inc_header_crc_failure(&self) {
        self.header_crc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transfer_crc_failure(&self) {
        self.transfer_crc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transfer_id_regression(&self) {
        self.transfer_id_regressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_out_of_order_frame(&self) {
        self.out_of_order_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reassembly_timeout(&self) {
        self.reassembly_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicate_transfer_dropped(&self) {
        self.duplicate_transfers_dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_item_expired(&self) {
        self.tx_items_expired.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain, `Clone`-able snapshot of [`Counters`] for callers that want to
/// compare two points in time without touching atomics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub header_crc_failures: u64,
    pub transfer_crc_failures: u64,
    pub transfer_id_regressions: u64,
    pub out_of_order_frames: u64,
    pub reassembly_timeouts: u64,
    pub duplicate_transfers_dropped: u64,
    pub tx_items_expired: u64,
}
