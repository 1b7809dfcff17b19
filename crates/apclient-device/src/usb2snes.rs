//! usb2snes WebSocket bridge.
//!
//! Speaks the usb2snes protocol served by SNI and QUsb2Snes: JSON request
//! frames, JSON `Results` replies and binary memory payloads, all in the
//! `SNES` (FXPak) address space.

use std::{sync::Arc, time::Duration};

use apclient_core::{Address, DeviceBridge, DeviceConnector, DeviceError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

/// Default SNI usb2snes endpoint.
pub const DEFAULT_USB2SNES_URL: &str = "ws://localhost:23074";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Request<'a> {
    opcode: &'a str,
    space: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    operands: Vec<String>,
}

impl<'a> Request<'a> {
    fn new(opcode: &'a str) -> Self {
        Self {
            opcode,
            space: "SNES",
            operands: Vec::new(),
        }
    }

    fn operands<I>(mut self, operands: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.operands = operands.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reply {
    #[serde(default)]
    results: Vec<String>,
}

fn unavailable(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Unavailable(e.to_string())
}

async fn open(url: &str) -> Result<WsStream, DeviceError> {
    let (ws, _response) = connect_async(url).await.map_err(unavailable)?;
    Ok(ws)
}

async fn send_request(ws: &mut WsStream, request: &Request<'_>) -> Result<(), DeviceError> {
    let json = serde_json::to_string(request).map_err(unavailable)?;
    tracing::trace!(%json, "-> usb2snes");
    ws.send(Message::Text(json)).await.map_err(unavailable)
}

async fn recv_results(ws: &mut WsStream) -> Result<Vec<String>, DeviceError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let reply: Reply = serde_json::from_str(&text).map_err(unavailable)?;
                return Ok(reply.results);
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(DeviceError::Unavailable("usb2snes closed the connection".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(unavailable(e)),
        }
    }
}

async fn recv_binary(ws: &mut WsStream, length: usize) -> Result<Vec<u8>, DeviceError> {
    let mut data = Vec::with_capacity(length);
    while data.len() < length {
        match ws.next().await {
            Some(Ok(Message::Binary(chunk))) => data.extend_from_slice(&chunk),
            Some(Ok(Message::Close(_))) | None => {
                return Err(DeviceError::ShortRead {
                    expected: length,
                    actual: data.len(),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(unavailable(e)),
        }
    }
    data.truncate(length);
    Ok(data)
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DeviceError::Timeout)?
}

/// Discovers devices through a usb2snes endpoint.
#[derive(Debug, Clone)]
pub struct Usb2SnesConnector {
    url: String,
    client_name: String,
    timeout: Duration,
}

impl Usb2SnesConnector {
    /// Create a connector for `url`, announcing itself as `client_name`.
    #[must_use]
    pub fn new(url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: client_name.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DeviceConnector for Usb2SnesConnector {
    async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        with_timeout(self.timeout, async {
            let mut ws = open(&self.url).await?;
            send_request(&mut ws, &Request::new("DeviceList")).await?;
            let devices = recv_results(&mut ws).await?;
            let _ = ws.close(None).await;
            Ok(devices)
        })
        .await
    }

    async fn attach(&self, device: &str) -> Result<Arc<dyn DeviceBridge>, DeviceError> {
        let ws = with_timeout(self.timeout, async {
            let mut ws = open(&self.url).await?;
            send_request(&mut ws, &Request::new("Attach").operands([device])).await?;
            send_request(
                &mut ws,
                &Request::new("Name").operands([self.client_name.as_str()]),
            )
            .await?;
            // Attach has no reply; Info confirms the device answers.
            send_request(&mut ws, &Request::new("Info")).await?;
            let info = recv_results(&mut ws).await?;
            tracing::info!(device, ?info, "Attached usb2snes device");
            Ok(ws)
        })
        .await?;

        Ok(Arc::new(Usb2SnesDevice {
            name: device.to_string(),
            ws: Mutex::new(ws),
            timeout: self.timeout,
        }))
    }
}

/// An attached usb2snes device.
///
/// Requests are serialised over one connection. After a failure the
/// connection state is undefined and the device should be discarded.
pub struct Usb2SnesDevice {
    name: String,
    ws: Mutex<WsStream>,
    timeout: Duration,
}

#[async_trait]
impl DeviceBridge for Usb2SnesDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, DeviceError> {
        let mut ws = self.ws.lock().await;
        with_timeout(self.timeout, async {
            let request =
                Request::new("GetAddress").operands([format!("{address:X}"), format!("{length:X}")]);
            send_request(&mut ws, &request).await?;
            recv_binary(&mut ws, length).await
        })
        .await
    }

    async fn write(&self, address: Address, data: &[u8]) -> Result<(), DeviceError> {
        let mut ws = self.ws.lock().await;
        with_timeout(self.timeout, async {
            let request = Request::new("PutAddress")
                .operands([format!("{address:X}"), format!("{:X}", data.len())]);
            send_request(&mut ws, &request).await?;
            ws.send(Message::Binary(data.to_vec()))
                .await
                .map_err(unavailable)
        })
        .await
    }
}
