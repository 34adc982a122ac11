/*!
 * SensorTag Daemon Client
 * JSON IPC communication with sensortagd
 */

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{Request, Response};

pub struct SensorTagClient {
    socket_path: String,
}

impl SensorTagClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("is sensortagd running? cannot reach {}", self.socket_path))?;
        let (reader, mut writer) = stream.into_split();

        let mut request_json = serde_json::to_vec(&request)?;
        request_json.push(b'\n');
        writer.write_all(&request_json).await?;

        let mut line = String::new();
        if BufReader::new(reader).read_line(&mut line).await? == 0 {
            bail!("daemon closed the connection without answering");
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}
