// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Polled NS16550A console used for kernel logs and the console file.
//!
//! Host builds have no device behind the MMIO window, so every byte is
//! discarded there.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::mm::layout::UART0;

const UART_TX: usize = 0x0;
const UART_RX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

static CONSOLE: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0));

/// UART implementation capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the console singleton.
    ///
    /// This is a plain `spin` lock rather than a [`crate::sync::SpinLock`]:
    /// logging must work before the per-hart state exists and from inside
    /// regions that already hold kernel locks.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        CONSOLE.lock()
    }

    pub fn put_byte(&self, byte: u8) {
        write_mmio(self.base, byte);
    }

    /// Returns a received byte if one is waiting.
    pub fn get_byte(&self) -> Option<u8> {
        read_mmio(self.base)
    }
}

#[inline]
fn read_mmio(base: usize) -> Option<u8> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `base` is the identity-mapped UART window on the virt machine.
    unsafe {
        if core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_RX_READY == 0 {
            return None;
        }
        Some(core::ptr::read_volatile((base + UART_RX) as *const u8))
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (base, UART_RX, LSR_RX_READY);
        None
    }
}

#[inline]
fn write_mmio(base: usize, value: u8) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `base` is the identity-mapped UART window on the virt machine.
    unsafe {
        while core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((base + UART_TX) as *mut u8, value);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (base, value, UART_TX, UART_LSR, LSR_TX_IDLE);
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }
            self.put_byte(byte);
        }
        Ok(())
    }
}

/// Lock-free writer for panic and trap paths where the console lock may
/// already be held by the interrupted code.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                write_mmio(UART0, b'\r');
            }
            write_mmio(UART0, byte);
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

/// Writes raw bytes to the console, translating `\n` to `\r\n`.
pub fn write_bytes(bytes: &[u8]) {
    let uart = KernelUart::lock();
    for &byte in bytes {
        if byte == b'\n' {
            uart.put_byte(b'\r');
        }
        uart.put_byte(byte);
    }
}

/// Writes a line terminated by `\n` to the console.
pub fn write_line(message: &str) {
    let mut uart = KernelUart::lock();
    let _ = uart.write_str(message);
    let _ = uart.write_str("\n");
}

/// Drains waiting input into `buf` without blocking; `\r` arrives as `\n`.
pub fn read_bytes(buf: &mut [u8]) -> usize {
    let uart = KernelUart::lock();
    let mut read = 0;
    while read < buf.len() {
        let Some(byte) = uart.get_byte() else {
            break;
        };
        buf[read] = if byte == b'\r' { b'\n' } else { byte };
        read += 1;
    }
    read
}
