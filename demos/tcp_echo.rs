// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::spindle::{
    Deadline,
    Fail,
    Listener,
    Runtime,
    Socket,
    TaskHandle,
};
use ::std::{
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const BUFFER_SIZE: usize = 64;
const NROUNDS: usize = 1024;
const IO_PATIENCE: Duration = Duration::from_secs(30);

//======================================================================================================================
// server()
//======================================================================================================================

/// Accepts connections forever, echoing every received byte back on a task of its own.
async fn server(local: SocketAddr) -> Result<(), Fail> {
    let listener: Listener = Listener::bind(local, 64)?;
    println!("listening on {}", listener.local_addr()?);
    loop {
        let (socket, peer): (Socket, SocketAddr) = listener.accept(Deadline::never()).await?;
        println!("accepted connection from {}", peer);
        let processor = spindle::current_processor()?;
        let handle: TaskHandle<Result<(), Fail>> = processor.spawn(async move {
            let mut buf: [u8; BUFFER_SIZE] = [0; BUFFER_SIZE];
            loop {
                let nbytes: usize = socket.recv_some(&mut buf, Deadline::never()).await?;
                if nbytes == 0 {
                    println!("connection from {} closed", peer);
                    return Ok(());
                }
                socket.send_all(&buf[..nbytes], Deadline::from_duration(IO_PATIENCE)).await?;
            }
        })?;
        handle.detach();
    }
}

//======================================================================================================================
// client()
//======================================================================================================================

/// Pushes a fixed payload and checks that exactly the same bytes come back, NROUNDS times.
async fn client(remote: SocketAddr) -> Result<(), Fail> {
    let socket: Socket = Socket::connect(remote, Deadline::from_duration(IO_PATIENCE)).await?;
    println!("connected to {}", remote);
    let payload: [u8; BUFFER_SIZE] = [0x65; BUFFER_SIZE];
    let mut echoed: [u8; BUFFER_SIZE] = [0; BUFFER_SIZE];
    for round in 0..NROUNDS {
        socket.send_all(&payload, Deadline::from_duration(IO_PATIENCE)).await?;
        socket.recv_all(&mut echoed, Deadline::from_duration(IO_PATIENCE)).await?;
        if echoed != payload {
            panic!("round {}: the echoed bytes differ from the sent ones", round);
        }
    }
    println!("echoed {} rounds of {} bytes", NROUNDS, BUFFER_SIZE);
    Ok(())
}

//======================================================================================================================
// usage()
//======================================================================================================================

/// Prints program usage and exits.
fn usage(program_name: &str) {
    println!("Usage: {} MODE address", program_name);
    println!("Modes:");
    println!("  --client    Run program in client mode.");
    println!("  --server    Run program in server mode.");
}

//======================================================================================================================
// main()
//======================================================================================================================

pub fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() >= 3 {
        let addr: SocketAddr = SocketAddr::from_str(&args[2])?;
        let runtime: Runtime = Runtime::with_defaults()?;
        let handle: TaskHandle<Result<(), Fail>> = if args[1] == "--server" {
            runtime.spawn(async move { server(addr).await })?
        } else if args[1] == "--client" {
            runtime.spawn(async move { client(addr).await })?
        } else {
            usage(&args[0]);
            return Ok(());
        };
        handle.wait()??;
        runtime.shutdown();
        return Ok(());
    }

    usage(&args[0]);
    Ok(())
}
