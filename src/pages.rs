//! HTML error pages returned by the dispatcher

use bytes::Bytes;
use html_escape::encode_text;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Errors the dispatcher answers with a synthesized page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPage {
    /// Request without a usable Host header
    MissingHost,
    /// No enabled mapping for the hostname
    UnmappedHost { hostname: String },
    /// The backend could not be reached
    UpstreamUnavailable { hostname: String, port: u16 },
    /// Anything else that went wrong inside the proxy
    Internal,
}

impl ErrorPage {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorPage::MissingHost => StatusCode::BAD_REQUEST,
            ErrorPage::UnmappedHost { .. } => StatusCode::NOT_FOUND,
            ErrorPage::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ErrorPage::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ErrorPage::MissingHost => "Bad Request",
            ErrorPage::UnmappedHost { .. } => "Domain Not Found",
            ErrorPage::UpstreamUnavailable { .. } => "Bad Gateway",
            ErrorPage::Internal => "Internal Server Error",
        }
    }

    fn message(&self) -> String {
        match self {
            ErrorPage::MissingHost => "The request did not carry a Host header.".to_string(),
            ErrorPage::UnmappedHost { hostname } => format!(
                "No enabled mapping exists for <strong>{}</strong>.",
                encode_text(hostname)
            ),
            ErrorPage::UpstreamUnavailable { hostname, port } => format!(
                "<strong>{}</strong> is mapped to port <strong>{}</strong>, but nothing answered there. \
                 Is the application running?",
                encode_text(hostname),
                port
            ),
            ErrorPage::Internal => "The proxy failed to handle this request.".to_string(),
        }
    }

    /// Render the page as an HTML document
    pub fn render(&self) -> String {
        let status = self.status();
        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{code} {title}</title></head>\n\
             <body>\n<h1>{code} {title}</h1>\n<p>{message}</p>\n<hr>\n<p><em>chost</em></p>\n</body>\n</html>\n",
            code = status.as_u16(),
            title = self.title(),
            message = self.message(),
        )
    }

    /// Full HTTP response for this page
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Response::new(
            Full::new(Bytes::from(self.render()))
                .map_err(|never| match never {})
                .boxed(),
        );
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }
}
