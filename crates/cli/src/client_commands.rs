use {
    anyhow::{Context, Result},
    clap::Subcommand,
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
};

use linkgate_sessions::render_terminal;

#[derive(Subcommand)]
pub enum ClientAction {
    /// Show the session status of a running gateway.
    Status,
    /// Begin pairing/connecting if the session is idle.
    Start,
    /// Print the current pairing code as a terminal QR.
    Qr,
    /// Send a text message.
    Send {
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        message: String,
    },
    /// Stop the session and drop its credentials.
    Logout,
    /// Tear down and reinitialize the session.
    Restart,
}

/// Thin JSON client for a running gateway.
pub struct ApiClient {
    base: String,
    token: Option<Secret<String>>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: &str, token: Option<String>) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(Secret::new),
            http: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let reason = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            anyhow::bail!("gateway returned {status}: {reason}");
        }
        Ok(value)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.call(reqwest::Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.call(reqwest::Method::POST, path, Some(body)).await
    }
}

pub async fn handle_client(client: &ApiClient, action: ClientAction) -> Result<()> {
    match action {
        ClientAction::Status => print_json(&client.get("/status").await?),
        ClientAction::Start => print_json(&client.post("/start", json!({})).await?),
        ClientAction::Qr => qr(client).await,
        ClientAction::Send { to, message } => {
            let receipt = client
                .post("/send", json!({ "recipient": to, "text": message }))
                .await?;
            println!(
                "sent {} to {} ({} attempt(s))",
                receipt["messageId"].as_str().unwrap_or("?"),
                receipt["recipient"].as_str().unwrap_or(&to),
                receipt["attempts"]
            );
            Ok(())
        },
        ClientAction::Logout => print_json(&client.post("/logout", json!({})).await?),
        ClientAction::Restart => print_json(&client.post("/restart", json!({})).await?),
    }
}

async fn qr(client: &ApiClient) -> Result<()> {
    let challenge = client.get("/qr").await?;
    let code = challenge["code"]
        .as_str()
        .context("gateway response has no pairing code")?;
    println!("{}", render_terminal(code)?);
    println!("Scan with the phone app to pair.");
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    #[tokio::test]
    async fn sends_bearer_token_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer s3cret")
            .match_body(Matcher::PartialJson(json!({ "recipient": "5511", "text": "hi" })))
            .with_status(200)
            .with_body(r#"{"success":true,"messageId":"m1","recipient":"5511@c.us","attempts":1}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&format!("{}/", server.url()), Some("s3cret".into()));
        let value = client
            .post("/send", json!({ "recipient": "5511", "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(value["messageId"], "m1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn surfaces_gateway_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/qr")
            .with_status(404)
            .with_body(r#"{"success":false,"error":"no pairing code available (status: ready)"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url(), None);
        let err = client.get("/qr").await.unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("no pairing code"));
    }
}
