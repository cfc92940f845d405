use log::*;
use std::io;
use std::path::Path;
use wsengine::config::load_tls_config;
use wsengine::{start_server_with_config, Event, Message, ServerConfig};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let tls_config = load_tls_config(Path::new("server.crt"), Path::new("server.key"))?;
    let config = ServerConfig {
        tls_config: Some(tls_config),
        ..Default::default()
    };

    let mut handle = start_server_with_config(9002, Some(config)).await?;
    info!("listening on: 127.0.0.1:9002 (tls)");

    while let Some(event) = handle.events.recv().await {
        match event {
            Event::NewClient(id, addr) => info!("new client {id}: {addr}"),
            Event::Message(id, message) => {
                let frame = match message {
                    Message::Text(text) => wsengine::send::format_message(
                        wsengine::frame::OpCode::Text,
                        text.as_bytes(),
                    ),
                    Message::Binary(data) => {
                        wsengine::send::format_message(wsengine::frame::OpCode::Binary, &data)
                    }
                };
                handle.registry.lock().await.send_to(id, frame);
            }
            Event::Disconnect(id, code, reason) => {
                info!("client {id} disconnected: {code} {reason}");
            }
            Event::Error(id, err) => warn!("client {id} error: {err}"),
        }
    }

    Ok(())
}
