use mill_nio::error::Result;
use mill_nio::{ChannelHandle, ChannelId, EventLoop, ReactorConfig};
use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

/// Messages from the accept thread and the decoders to the main thread
enum Message {
    Accepted(ChannelHandle),
    Data(ChannelId, Vec<u8>),
    Closed(ChannelId),
}

fn main() -> Result<()> {
    let event_loop = EventLoop::new(ReactorConfig::default())?;
    let listener = TcpListener::bind("127.0.0.1:8080")?;
    println!(
        "echo server listening on {} with {} selectors",
        listener.local_addr()?,
        event_loop.selectors()
    );

    let (tx, rx) = mpsc::channel::<Message>();

    thread::scope(|scope| -> Result<()> {
        let accept_tx = tx;
        let event_loop = &event_loop;
        scope.spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        eprintln!("accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nonblocking(true) {
                    eprintln!("set_nonblocking failed: {e}");
                    continue;
                }

                let data_tx = accept_tx.clone();
                let decoder = move |id: ChannelId, buf: &[u8]| -> io::Result<usize> {
                    let _ = data_tx.send(Message::Data(id, buf.to_vec()));
                    Ok(buf.len())
                };
                let handle =
                    match event_loop.register(mio::net::TcpStream::from_std(stream), decoder) {
                        Ok(handle) => handle,
                        Err(e) => {
                            eprintln!("register failed: {e}");
                            break;
                        }
                    };

                let close_tx = accept_tx.clone();
                let registered = handle.on_close(move |id, cause| {
                    if let Some(cause) = cause {
                        eprintln!("{id} closed: {cause}");
                    }
                    close_tx.send(Message::Closed(id))?;
                    Ok(())
                });
                if registered.is_err() || accept_tx.send(Message::Accepted(handle)).is_err() {
                    break;
                }
            }
        });

        let mut clients: HashMap<ChannelId, ChannelHandle> = HashMap::new();
        // data can overtake the Accepted message of its channel
        let mut early: HashMap<ChannelId, Vec<u8>> = HashMap::new();
        for message in rx {
            match message {
                Message::Accepted(handle) => {
                    println!("{} connected", handle.id());
                    if let Some(bytes) = early.remove(&handle.id()) {
                        echo(&handle, bytes)?;
                    }
                    clients.insert(handle.id(), handle);
                }
                Message::Data(id, bytes) => match clients.get(&id) {
                    Some(handle) => echo(handle, bytes)?,
                    None => early.entry(id).or_default().extend_from_slice(&bytes),
                },
                Message::Closed(id) => {
                    clients.remove(&id);
                    early.remove(&id);
                    println!("{id} disconnected");
                }
            }
        }
        Ok(())
    })
}

fn echo(handle: &ChannelHandle, bytes: Vec<u8>) -> Result<()> {
    let id = handle.id();
    handle.write(bytes, move |result| {
        if let Err(e) = result {
            eprintln!("{id} echo failed: {e}");
        }
        Ok(())
    })
}
