// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel diagnostics: leveled logging over the console UART.

pub mod log;
