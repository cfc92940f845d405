use log::*;
use wsengine::{start_server, Event, Message};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut handle = start_server(9002).await.expect("can't listen");
    info!("listening on: 127.0.0.1:9002");

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
}
