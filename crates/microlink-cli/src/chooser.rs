// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Serial port chooser: enumerate candidate devices and prompt for one.

use rustyline::DefaultEditor;

/// List the available serial ports and ask the user to pick one by
/// number. Returns `None` when there is nothing to offer or the user
/// bails out with ctrl-D.
pub fn select_port() -> Option<String> {
    let ports = microlink_transports::serial::available_ports();
    if ports.is_empty() {
        eprintln!("No serial ports found.");
        return None;
    }

    println!("Select the serial port:");
    for (i, port) in ports.iter().enumerate() {
        println!("{:3}: {}", i + 1, port);
    }

    let mut editor = DefaultEditor::new().ok()?;
    loop {
        let reply = editor.readline("? ").ok()?;
        if let Ok(choice) = reply.trim().parse::<usize>() {
            if choice >= 1 && choice <= ports.len() {
                return Some(ports[choice - 1].clone());
            }
        }
        println!("Enter number of desired port or ctrl-d to quit.");
    }
}
