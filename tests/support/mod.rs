#![allow(dead_code)]

pub mod client;
pub mod harness;
pub mod net;
pub mod upstream;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..read]);
        if collected.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    Ok(collected)
}
