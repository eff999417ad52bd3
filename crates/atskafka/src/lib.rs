// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bridge between a log demultiplexer's Unix socket and Kafka.
//!
//! Lines read from the socket by the [`supervisor::ReconnectSupervisor`] are parsed
//! into JSON by a [`worker::WorkerPool`] and published through a
//! [`worker::Publisher`]. Broker delivery reports and statistics come back through
//! the [`delivery::DeliveryFeedbackLoop`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod delivery;
pub mod errors;
pub mod metrics;
pub mod parser;
pub mod producer;
pub mod reader;
pub mod server;
pub mod supervisor;
pub mod worker;
