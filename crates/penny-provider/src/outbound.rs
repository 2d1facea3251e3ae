//! Outbound HTTP transport shared by every [`crate::adapters::HttpAdapter`].
//!
//! Grounded on `querymt::outbound::call_outbound`: a single process-wide
//! `reqwest::Client` bridging `http::Request<Vec<u8>>` to `reqwest` and
//! back, so adapters never build their own client pool.

use http::{Request, Response};
use once_cell::sync::Lazy;
use reqwest::Client;
use std::error::Error;

static CLIENT: Lazy<Client> = Lazy::new(Client::new);

pub async fn call_outbound(req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, Box<dyn Error>> {
    let client = &*CLIENT;

    let method = req.method().as_str().parse::<reqwest::Method>()?;
    let mut rb = client.request(method, req.uri().to_string());

    for (name, value) in req.headers().iter() {
        rb = rb.header(name.as_str(), value.to_str()?);
    }

    let resp = rb.body(req.into_body()).send().await?.error_for_status()?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.bytes().await?.to_vec();

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    Ok(builder.body(bytes)?)
}
