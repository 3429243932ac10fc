// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use std::net::{TcpListener, TcpStream};

/// Return an ephemeral, available port. Ports are probed at random within
/// the dynamic range, which keeps concurrent callers from racing each other
/// up a sequential scan. On unix systems, the port returned will be in the
/// TIME_WAIT state ensuring that the OS won't hand out this port for some
/// grace period. Callers should be able to bind to this port given they use
/// SO_REUSEADDR.
pub fn get_available_port() -> u16 {
    const MAX_PORT_RETRIES: u32 = 1000;
    const DYNAMIC_PORT_RANGE: (u16, u16) = (49152, u16::MAX);

    let mut rng = rand::thread_rng();
    for _ in 0..MAX_PORT_RETRIES {
        let candidate = rng.gen_range(DYNAMIC_PORT_RANGE.0, DYNAMIC_PORT_RANGE.1);
        if let Ok(port) = try_reserve_port(candidate) {
            return port;
        }
    }

    panic!("Error: could not find an available port");
}

fn try_reserve_port(port: u16) -> std::io::Result<u16> {
    let listener = TcpListener::bind(("localhost", port))?;
    let addr = listener.local_addr()?;

    // Create and accept a connection (which we'll promptly drop) in order to force the port
    // into the TIME_WAIT state, ensuring that the port will be reserved from some limited
    // amount of time (roughly 60s on some Linux systems)
    let connection = TcpStream::connect(addr)?;
    let _incoming = listener.accept()?;
    drop(connection);

    Ok(addr.port())
}
