// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example driving the simulated DPI accelerator.
//!
//! Run with: `cargo run --example basic`

use dpi_accel::regs::Status;
use dpi_accel::sim::{default_binding, SimPlatform};
use dpi_accel::{DpiConfig, DpiDriver, DpiError, DRIVER_NAME, DRIVER_VERSION};
use std::thread;
use std::time::Duration;

/// Pretend accelerator: flags payloads containing `needle`.
fn finish(sim: &SimPlatform, payload: &[u8], needle: &[u8]) {
    let hit = payload.windows(needle.len()).any(|w| w == needle);
    let status = if hit {
        Status::FILTER_DONE | Status::MATCH
    } else {
        Status::FILTER_DONE
    };
    sim.complete_transfer(status.bits());
}

fn main() {
    println!("{DRIVER_NAME} {DRIVER_VERSION} Basic Example");
    println!("==========================\n");

    let sim = SimPlatform::new();
    let config = DpiConfig::default().with_polling(Duration::from_millis(1), 100);
    let driver = DpiDriver::new(config);

    println!("Probing simulated device...");
    if let Err(e) = driver.probe(sim.clone(), &default_binding()) {
        println!("  Probe failed: {}", e);
        return;
    }
    println!("  Bound: {}", driver.is_bound());
    println!();

    println!("Loading filter table...");
    match driver.reset_filter_table() {
        Ok(()) => {
            sim.complete_transfer(Status::RESET_DONE.bits());
            println!("  Filter table reset");
        }
        Err(e) => println!("  Reset failed: {}", e),
    }
    println!();

    println!("Inspecting payloads...");
    let payloads: [&[u8]; 3] = [
        b"GET /index.html HTTP/1.1\r\n",
        b"GET /cgi-bin/../../etc/passwd HTTP/1.1\r\n",
        b"POST /login HTTP/1.1\r\n",
    ];
    for payload in payloads {
        if let Err(e) = driver.submit_payload(payload) {
            println!("  Submit failed: {}", e);
            continue;
        }
        let hw = sim.clone();
        let bytes = payload.to_vec();
        let irq = thread::spawn(move || {
            thread::sleep(Duration::from_micros(200));
            finish(&hw, &bytes, b"../");
        });
        match driver.get_filter_result() {
            Ok(bits) => println!(
                "  {:?}: {}",
                String::from_utf8_lossy(payload).trim_end(),
                if bits != 0 { "MATCH" } else { "clean" }
            ),
            Err(e) => println!("  Result unavailable: {}", e),
        }
        let _ = irq.join();
    }
    println!();

    println!("Recovering from a lost interrupt...");
    if driver.submit_payload(b"never answered").is_ok() {
        match driver.get_filter_result() {
            Err(DpiError::Timeout { status }) => {
                println!("  Timed out, status {:#010x}", status);
                println!("  Next submit: {:?}", driver.submit_payload(b"x").err());
                if driver.reset_filter_table().is_ok() {
                    sim.complete_transfer(Status::RESET_DONE.bits());
                }
                let accepted = driver.submit_payload(b"x").is_ok();
                println!("  After reset, accepts payloads: {}", accepted);
                sim.complete_transfer(Status::FILTER_DONE.bits());
                println!("  Result code: {}", driver.result_code());
            }
            other => println!("  Unexpected: {:?}", other),
        }
    }
    println!();

    driver.remove();
    println!("Done!");
}
