// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships login/logout sessions from a wtmpx record stream to a central collector.
//!
//! The agent side ([`agent`]) tails the record stream ([`parse_stage`]), pairs logins with
//! their logouts ([`pairing`]) and forwards the pairs ([`transmitter`]), handing work between
//! stages through durable files ([`staging`]). The collector side ([`collector`]) accepts
//! many agents at once and funnels their lines into a single [`writer_service`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod collector;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pairing;
pub mod parse_stage;
pub mod record;
pub mod staging;
pub mod transmitter;
pub mod writer_service;
