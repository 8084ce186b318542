// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! UART-friendly selftest assertion helpers.

use alloc::format;
use alloc::string::String;

use crate::uart;

/// Emits the failure message and panics, so the panic handler prints the
/// hart and task state afterwards.
#[cold]
pub fn report_failure(message: &str) -> ! {
    let line = format!("SELFTEST: fail: {message}");
    uart::write_line(&line);
    panic!("{}", line);
}

#[cold]
pub fn report_failure_fmt(args: core::fmt::Arguments<'_>) -> ! {
    use core::fmt::Write;

    let mut buffer = String::new();
    let _ = write!(buffer, "{args}");
    report_failure(&buffer);
}

/// Asserts that the condition evaluates to true.
#[macro_export]
macro_rules! st_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::selftest::assert::report_failure(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::selftest::assert::report_failure_fmt(format_args!($($arg)+));
        }
    };
}

/// Expects both expressions to be equal using `PartialEq`.
#[macro_export]
macro_rules! st_expect_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left != *right {
            $crate::selftest::assert::report_failure_fmt(format_args!(
                "expected {} == {}: left={:?} right={:?}",
                stringify!($left),
                stringify!($right),
                left,
                right
            ));
        }
    }};
}

/// Ensures that the expression evaluates to `Err` matching the provided pattern.
#[macro_export]
macro_rules! st_expect_err {
    ($expr:expr, $pat:pat $(,)?) => {{
        match $expr {
            Err(err) => {
                if !matches!(err, $pat) {
                    $crate::selftest::assert::report_failure_fmt(format_args!(
                        "unexpected error variant: got={:?}",
                        err
                    ));
                }
            }
            Ok(_) => {
                $crate::selftest::assert::report_failure(concat!("expected Err(", stringify!($pat), "), got Ok"));
            }
        }
    }};
}
