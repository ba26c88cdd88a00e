use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::AppContext;
use crate::proxy::http::request::read_request_head;
use crate::proxy::http::response::send_error;
use crate::proxy::pipeline::{ClientDisposition, handle_request};

const KEEPALIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_HEAD_BYTES: usize = 32 * 1024;

/// Keep-alive loop over one downstream connection: read a request head,
/// run it through the pipeline, continue or close per its disposition.
pub(crate) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_request_head(
            &mut reader,
            peer,
            KEEPALIVE_IDLE_TIMEOUT,
            REQUEST_HEAD_TIMEOUT,
            MAX_REQUEST_HEAD_BYTES,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %err, "invalid request");
                let _ = send_error(
                    reader.get_mut(),
                    http::StatusCode::BAD_REQUEST,
                    "invalid request\n",
                )
                .await;
                break;
            }
        };

        match handle_request(&mut reader, peer, &app, head, start.into_std()).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    reader.get_mut().shutdown().await.ok();
    Ok(())
}
