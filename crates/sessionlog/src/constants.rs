// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Line that ends a batch on the wire.
pub const SENTINEL: &str = "over";
/// Collector reply once every line of a batch has been queued.
pub const ACK_OK: &str = "OK";
/// Collector reply when handling a batch failed.
pub const ACK_ERROR: &str = "ERROR";

pub const DEFAULT_COLLECTOR_PORT: u16 = 8088;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
