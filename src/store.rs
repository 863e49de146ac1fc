//! Store helpers
//!
//! Thin utilities over the MongoDB driver: error classification and
//! sort-document construction.

use bson::Document;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};

const DUPLICATE_KEY: i32 = 11000;

/// Whether a store error reports a unique-key violation.
pub fn is_duplicate_key(err: &MongoError) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteConcernError(wce)) => wce.code == DUPLICATE_KEY,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Sort document from translated sort keys; a `-` prefix sorts
/// descending.
pub fn sort_doc(keys: &[String]) -> Document {
    let mut doc = Document::new();
    for key in keys {
        match key.strip_prefix('-') {
            Some(field) => doc.insert(field, -1),
            None => doc.insert(key.as_str(), 1),
        };
    }
    doc
}
