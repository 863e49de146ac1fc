//! Image-resource handler
//!
//! Binary upload/download backed by grid-file storage, with named
//! server-side resizing bounds. Decoding, encoding and resizing are
//! delegated to pluggable codecs; the handler owns the bound math, the
//! media-type gate and the storage naming scheme
//! (`<identity>.<extension>`).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bson::doc;
use bytes::Bytes;
use futures_util::io::{AsyncReadExt, AsyncWriteExt};
use futures_util::TryStreamExt;
use tracing::debug;

use crate::context::Context;
use crate::engine::{Engine, ImageResource};
use crate::handler::{Handler, Outcome, Req};
use crate::resid::ResId;
use crate::types::{Error, ErrorKind, Result};

/// How a named bound constrains the output size. Aspect ratio is always
/// preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    /// Fit inside a square of the given side.
    Square,
    Width,
    Height,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub kind: BoundKind,
    pub value: u32,
}

/// Output dimensions for a source size under a bound.
pub fn adjust_size(width: u32, height: u32, bound: &Bound) -> (u32, u32) {
    let (w, h) = (width as f64, height as f64);
    let v = bound.value as f64;
    let scale = |x: f64, s: f64| (x * s + 0.5).floor() as u32;
    match bound.kind {
        BoundKind::Square => {
            let s = (v / w).min(v / h);
            (scale(w, s), scale(h, s))
        }
        BoundKind::Width => (bound.value, scale(h, v / w)),
        BoundKind::Height => (scale(w, v / h), bound.value),
    }
}

/// Pluggable image codec: one per supported format.
pub trait ImageCodec: Send + Sync {
    /// Format name, also the stored file extension ("png", "jpeg").
    fn format(&self) -> &str;
    /// Whether the payload header is this format.
    fn sniff(&self, head: &[u8]) -> bool;
    /// Source dimensions of an encoded payload.
    fn dimensions(&self, data: &[u8]) -> std::result::Result<(u32, u32), String>;
    /// Re-encode scaled to exactly (w, h).
    fn resize(&self, data: &[u8], w: u32, h: u32) -> std::result::Result<Vec<u8>, String>;
}

/// Binary payload or location, the request/response value of image
/// resources.
#[derive(Clone, Default)]
pub struct Binary {
    pub data: Option<Bytes>,
    pub media_type: Option<String>,
    pub location: Option<ResId>,
}

impl Binary {
    pub fn from_payload(data: Bytes, media_type: impl Into<String>) -> Self {
        Binary { data: Some(data), media_type: Some(media_type.into()), location: None }
    }

    pub fn at_location(location: ResId) -> Self {
        Binary { data: None, media_type: None, location: Some(location) }
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("len", &self.data.as_ref().map(|d| d.len()))
            .field("media_type", &self.media_type)
            .field("location", &self.location.as_ref().map(|l| l.format()))
            .finish()
    }
}

pub struct ImageHandler {
    iq: ImageResource,
}

impl ImageHandler {
    pub fn new(iq: ImageResource) -> Self {
        ImageHandler { iq }
    }

    fn sniff(&self, data: &[u8]) -> Option<&Arc<dyn ImageCodec>> {
        let head = &data[..data.len().min(64)];
        self.iq.codecs.iter().find(|c| c.sniff(head))
    }

    /// Sorted listing of valid size names, for the rejection message.
    fn valid_sizes(&self) -> String {
        self.iq
            .bounds
            .iter()
            .map(|(name, b)| {
                let t = match b.kind {
                    BoundKind::Square => "s",
                    BoundKind::Width => "w",
                    BoundKind::Height => "h",
                };
                format!("{}:{}{}", name, t, b.value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl Handler for ImageHandler {
    fn capabilities(&self) -> crate::engine::Allow {
        crate::engine::Allow::GET | crate::engine::Allow::POST
    }

    async fn post(&self, _engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let bin = req.take_binary();
        let data = bin.data.ok_or_else(|| {
            Error::with_msg(ErrorKind::InternalServerError, "no payload in request")
        })?;
        let declared = bin.media_type.unwrap_or_default();
        let main = declared.split(';').next().unwrap_or("").trim();
        let parts: Vec<&str> = main.split('/').collect();
        if parts.len() != 2 || parts[0] != "image" {
            return Err(Error::with_msg(
                ErrorKind::UnsupportedMediaType,
                format!("unsupported media type '{}'", declared),
            ));
        }
        // The header decides the actual format, not the declared subtype.
        let codec = self
            .sniff(&data)
            .ok_or_else(|| Error::bad_request("parse image file error"))?;
        let format = codec.format().to_string();
        let media_type = format!("image/{}", format);

        let id = bson::oid::ObjectId::new();
        let filename = format!("{}.{}", id.to_hex(), format);
        let bucket = ctx.bucket();
        let mut upload = bucket
            .open_upload_stream(&filename)
            .metadata(doc! {"contentType": &media_type})
            .await
            .map_err(|e| Error::with_cause(ErrorKind::InternalServerError, "create file", e))?;
        upload
            .write_all(&data)
            .await
            .map_err(|e| Error::with_cause(ErrorKind::InternalServerError, "write file", e))?;
        upload
            .close()
            .await
            .map_err(|e| Error::with_cause(ErrorKind::InternalServerError, "close file", e))?;
        debug!(%filename, bytes = data.len(), "image stored");

        Ok(Outcome::Binary(Binary::at_location(ResId::new(
            req.res_id.name(),
            vec![filename],
        ))))
    }

    async fn get(&self, _engine: &Engine, req: &mut Req, ctx: &mut Context) -> Result<Outcome> {
        let bound = match req.res_id.params.get("size") {
            Some(size) => Some(*self.iq.bounds.get(size).ok_or_else(|| {
                Error::bad_request(format!(
                    "invalid value for size:'{}', ALLOW: {}",
                    size,
                    self.valid_sizes()
                ))
            })?),
            None => None,
        };
        let filename = req.res_id.raw_segment(0).ok_or_else(Error::not_found)?;
        let (id_part, ext) = filename
            .split_once('.')
            .ok_or_else(|| Error::bad_request("filename format error"))?;
        bson::oid::ObjectId::parse_str(id_part).map_err(|e| {
            Error::with_cause(ErrorKind::BadRequest, "filename format error", e)
        })?;

        let bucket = ctx.bucket();
        let file = bucket
            .find(doc! {"filename": filename})
            .await
            .map_err(Error::internal)?
            .try_next()
            .await
            .map_err(Error::internal)?
            .ok_or_else(Error::not_found)?;
        let media_type = file
            .metadata
            .as_ref()
            .and_then(|m| m.get_str("contentType").ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("image/{}", ext));

        let mut stream = bucket
            .open_download_stream_by_name(filename)
            .await
            .map_err(Error::internal)?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.map_err(Error::internal)?;

        let data = match bound {
            Some(bound) => {
                // The stored bytes decide the format, not the filename.
                let codec = self
                    .sniff(&data)
                    .ok_or_else(|| Error::bad_request("parse image file error"))?;
                let (w, h) = codec
                    .dimensions(&data)
                    .map_err(|e| Error::bad_request(format!("parse image file error: {}", e)))?;
                let (w, h) = adjust_size(w, h, &bound);
                codec
                    .resize(&data, w, h)
                    .map_err(|e| Error::bad_request(format!("resize image error: {}", e)))?
            }
            None => data,
        };
        Ok(Outcome::Binary(Binary::from_payload(Bytes::from(data), media_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_size_square_fits_longest_side() {
        let b = Bound { kind: BoundKind::Square, value: 100 };
        assert_eq!(adjust_size(200, 100, &b), (100, 50));
        assert_eq!(adjust_size(100, 200, &b), (50, 100));
        assert_eq!(adjust_size(50, 50, &b), (100, 100));
    }

    #[test]
    fn test_adjust_size_width_and_height() {
        let b = Bound { kind: BoundKind::Width, value: 100 };
        assert_eq!(adjust_size(200, 100, &b), (100, 50));
        let b = Bound { kind: BoundKind::Height, value: 100 };
        assert_eq!(adjust_size(200, 100, &b), (200, 100));
        // rounding is to nearest
        let b = Bound { kind: BoundKind::Width, value: 100 };
        assert_eq!(adjust_size(300, 100, &b), (100, 33));
    }

    #[test]
    fn test_valid_sizes_listing() {
        let mut bounds = std::collections::BTreeMap::new();
        bounds.insert("icon".to_string(), Bound { kind: BoundKind::Square, value: 64 });
        bounds.insert("wide".to_string(), Bound { kind: BoundKind::Width, value: 320 });
        let handler = ImageHandler::new(ImageResource { bounds, codecs: Vec::new() });
        assert_eq!(handler.valid_sizes(), "icon:s64, wide:w320");
    }
}
