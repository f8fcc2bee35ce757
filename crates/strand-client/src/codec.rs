//! A thin HTTP/1.0 codec layered over a circuit stream.
//!
//! Requests are encoded in a quick and dirty HTTP 1.0 format, and
//! responses are parsed incrementally with `httparse`.  This is not a
//! general HTTP client: no redirects, no chunked transfer encoding,
//! no keep-alive.  One request, one response, one stream.

use crate::{Error, Result};

use futures::io::{AsyncRead, AsyncReadExt};

/// Largest response we'll accept before giving up.
const MAX_RESPONSE_LEN: usize = 10 * 1024 * 1024;

/// Largest header block we'll accept.
const MAX_HEADERS_LEN: usize = 16384;

/// An HTTP response as returned to callers.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The response status code.
    pub status: u16,
    /// Response headers, in wire order.
    pub headers: Vec<(String, String)>,
    /// The response body.
    pub body: Vec<u8>,
    /// The URL the request was made to.
    pub url: String,
}

impl HttpResponse {
    /// Decode the body as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.body.clone())?)
    }

    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Encode an HTTP request in HTTP 1.0 format, headers then body.
pub(crate) fn encode_request(req: &http::Request<Vec<u8>>) -> Vec<u8> {
    let mut s = format!("{} {} HTTP/1.0\r\n", req.method(), req.uri());

    for (key, val) in req.headers().iter() {
        s.push_str(&format!(
            "{}: {}\r\n",
            key,
            String::from_utf8_lossy(val.as_bytes())
        ));
    }
    s.push_str("\r\n");

    let mut encoded = s.into_bytes();
    encoded.extend_from_slice(req.body());
    encoded
}

/// Read and parse an HTTP/1 response from `stream`.
pub(crate) async fn read_response<S>(stream: &mut S, url: &str) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; 1024];
    let mut n_in_buf = 0;

    // Header phase: read until httparse sees a complete response head.
    let (status, headers, content_length) = loop {
        let n = stream.read(&mut buf[n_in_buf..]).await?;
        n_in_buf += n;

        let mut header_buf = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut header_buf);
        let res = response.parse(&buf[..n_in_buf])?;

        if res.is_partial() {
            // We didn't get a whole response head; we may need to try
            // again.
            if n == 0 {
                return Err(Error::TruncatedHeaders);
            }
            if n_in_buf >= buf.len() - 500 {
                if buf.len() >= MAX_HEADERS_LEN {
                    return Err(Error::Httparse(httparse::Error::TooManyHeaders));
                }
                buf.resize(buf.len() * 2, 0_u8);
            }
        } else {
            let status = response.code.ok_or(Error::TruncatedHeaders)?;
            let headers: Vec<(String, String)> = response
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            let content_length = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok());

            let n_parsed = res.unwrap();
            buf.copy_within(n_parsed.., 0);
            n_in_buf -= n_parsed;
            break (status, headers, content_length);
        }
    };

    // Body phase: bounded by Content-Length when present, EOF
    // otherwise.
    let mut body = buf[..n_in_buf].to_vec();
    match content_length {
        Some(len) => {
            if len > MAX_RESPONSE_LEN {
                return Err(Error::ResponseTooLong(len));
            }
            body.truncate(len);
            while body.len() < len {
                let mut chunk = vec![0_u8; (len - body.len()).min(4096)];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }
        None => loop {
            let mut chunk = [0_u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
            if body.len() > MAX_RESPONSE_LEN {
                return Err(Error::ResponseTooLong(body.len()));
            }
        },
    }

    Ok(HttpResponse {
        status,
        headers,
        body,
        url: url.to_string(),
    })
}
