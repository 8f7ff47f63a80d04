//! HTTP POST transport for MSGRPC.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use rmpv::Value;

use redlab_domain::config::MsgRpcConfig;
use redlab_domain::{AuthToken, ConsoleSessionId, RpcEndpoint, RpcError};

use crate::wire;
use crate::{ConsoleChunk, ConsoleSession, MsgRpc};

const RPC_PATH: &str = "/api/";
const MSGPACK_CONTENT_TYPE: &str = "binary/message-pack";

/// MSGRPC client speaking MessagePack over HTTP POST.
///
/// Stateless apart from the connection pool: endpoint and token travel
/// with every call, so one client serves every container.
pub struct HttpMsgRpc {
    client: reqwest::Client,
}

impl HttpMsgRpc {
    pub fn new(config: &MsgRpcConfig) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn call_raw(
        &self,
        endpoint: &RpcEndpoint,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        let body = wire::encode_request(method, args);
        let url = format!("http://{endpoint}{RPC_PATH}");
        tracing::trace!(%endpoint, method, "msgrpc call");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        wire::decode_response(&bytes)
    }
}

/// Console ids arrive as strings from current servers but were integers
/// historically; accept both.
fn console_id(value: &Value) -> Result<ConsoleSessionId, RpcError> {
    if let Some(s) = wire::value_str(wire::map_get(value, "id")) {
        return Ok(ConsoleSessionId::new(s));
    }
    if let Some(n) = wire::value_u64(wire::map_get(value, "id")) {
        return Ok(ConsoleSessionId::new(n.to_string()));
    }
    Err(RpcError::Decode("console response missing 'id'".into()))
}

#[async_trait]
impl MsgRpc for HttpMsgRpc {
    async fn login(
        &self,
        endpoint: &RpcEndpoint,
        user: &str,
        password: &str,
    ) -> Result<AuthToken, RpcError> {
        let response = self
            .call_raw(
                endpoint,
                "auth.login",
                &[Value::from(user), Value::from(password)],
            )
            .await?;
        let token = wire::required_str(&response, "token")?;
        Ok(AuthToken::new(token))
    }

    async fn console_create(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
    ) -> Result<ConsoleSession, RpcError> {
        let response = self
            .call_raw(endpoint, "console.create", &[Value::from(token.expose())])
            .await?;
        Ok(ConsoleSession {
            id: console_id(&response)?,
            prompt: wire::value_str(wire::map_get(&response, "prompt"))
                .unwrap_or_default()
                .to_owned(),
            busy: wire::value_bool(wire::map_get(&response, "busy")).unwrap_or(false),
        })
    }

    async fn console_destroy(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
    ) -> Result<(), RpcError> {
        self.call_raw(
            endpoint,
            "console.destroy",
            &[Value::from(token.expose()), Value::from(console.as_str())],
        )
        .await?;
        Ok(())
    }

    async fn console_write(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
        data: &str,
    ) -> Result<u64, RpcError> {
        let response = self
            .call_raw(
                endpoint,
                "console.write",
                &[
                    Value::from(token.expose()),
                    Value::from(console.as_str()),
                    Value::from(data),
                ],
            )
            .await?;
        wire::value_u64(wire::map_get(&response, "wrote"))
            .ok_or_else(|| RpcError::Decode("write response missing 'wrote'".into()))
    }

    async fn console_read(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
    ) -> Result<ConsoleChunk, RpcError> {
        let response = self
            .call_raw(
                endpoint,
                "console.read",
                &[Value::from(token.expose()), Value::from(console.as_str())],
            )
            .await?;
        let busy = wire::value_bool(wire::map_get(&response, "busy")).unwrap_or(false);
        Ok(ConsoleChunk {
            data: wire::value_str(wire::map_get(&response, "data"))
                .unwrap_or_default()
                .to_owned(),
            busy,
            prompt: if busy {
                None
            } else {
                wire::value_str(wire::map_get(&response, "prompt")).map(str::to_owned)
            },
        })
    }

    async fn call(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(Value::from(token.expose()));
        full_args.extend(args);
        self.call_raw(endpoint, method, &full_args).await
    }
}
