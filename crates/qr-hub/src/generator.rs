//! # Request generator
//!
//! Turns parsed stage tokens into typed [`RecordRequest`]s, validating each
//! stage's argument count and shape. Any failure here short-circuits the
//! whole pipeline. A `rid(..)` stage anywhere in the pipeline re-tags every
//! request of that pipeline, letting batched clients correlate replies.

use std::sync::Arc;

use qr_core::error::ErrorKind;
use qr_core::params::Value;
use qr_core::{RecordRequest, ResponseError};

use crate::parser::{split_stage, unquote};

/// The seam routed documents use to turn stage tokens into requests.
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        rid: &str,
        doc: &str,
        stages: &[String],
    ) -> Result<Vec<RecordRequest>, ResponseError>;
}

/// The stock generator covering the core stage vocabulary.
pub struct BasicGenerator;

impl Generator for BasicGenerator {
    fn generate(
        &self,
        rid: &str,
        doc: &str,
        stages: &[String],
    ) -> Result<Vec<RecordRequest>, ResponseError> {
        let mut rid = rid.to_string();
        let mut ops = Vec::with_capacity(stages.len());

        for token in stages {
            let (name, args) = split_stage(token);
            if name == "rid" {
                match args.first().map(|a| unquote(a)) {
                    Some(tag) if !tag.is_empty() => rid = tag,
                    _ => {
                        return Err(ResponseError::new(
                            ErrorKind::MissingValue,
                            rid,
                            "rid stage requires a tag",
                        ))
                    }
                }
                continue;
            }
            ops.push((name, args));
        }

        if ops.is_empty() {
            return Err(ResponseError::new(
                ErrorKind::Parse,
                rid,
                "pipeline has no executable stages",
            ));
        }

        let mut requests = Vec::with_capacity(ops.len());
        for (name, args) in ops {
            requests.push(generate_stage(&rid, doc, &name, &args)?);
        }
        Ok(requests)
    }
}

fn generate_stage(
    rid: &str,
    doc: &str,
    name: &str,
    args: &[String],
) -> Result<RecordRequest, ResponseError> {
    match name {
        "findN" => {
            let (amount, skip) = match args.len() {
                0 => (-1, 0),
                1 => (parse_int(rid, &args[0])?, 0),
                _ => (parse_int(rid, &args[0])?, parse_int(rid, &args[1])?),
            };
            Ok(RecordRequest::FindN {
                doc: doc.to_string(),
                rid: rid.to_string(),
                amount,
                skip,
            })
        }
        "find" => match args.len() {
            0 => Err(ResponseError::new(
                ErrorKind::MissingKey,
                rid,
                "find requires a key",
            )),
            1 => Err(ResponseError::new(
                ErrorKind::MissingValue,
                rid,
                "find requires a value",
            )),
            _ => Ok(RecordRequest::Find {
                doc: doc.to_string(),
                rid: rid.to_string(),
                key: unquote(&args[0]),
                value: unquote(&args[1]),
            }),
        },
        "collects" => Ok(RecordRequest::Collects {
            rid: rid.to_string(),
            keys: args.iter().map(|a| unquote(a)).collect(),
        }),
        "mutate" => {
            if args.is_empty() {
                return Err(ResponseError::new(
                    ErrorKind::MissingJson,
                    rid,
                    "mutate requires a json parameter",
                ));
            }
            let parameter = match serde_json::from_str::<Value>(&args[0]) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(ResponseError::new(
                        ErrorKind::InvalidJson,
                        rid,
                        "mutate parameter must be a json object",
                    ))
                }
                Err(err) => {
                    return Err(ResponseError::new(
                        ErrorKind::InvalidJson,
                        rid,
                        "mutate parameter is not valid json",
                    )
                    .with_cause(err))
                }
            };
            Ok(RecordRequest::Mutate {
                doc: doc.to_string(),
                rid: rid.to_string(),
                parameter,
            })
        }
        other => Err(ResponseError::new(
            ErrorKind::UnknownStage,
            rid,
            format!("unknown stage '{other}'"),
        )),
    }
}

fn parse_int(rid: &str, arg: &str) -> Result<i64, ResponseError> {
    unquote(arg).parse::<i64>().map_err(|err| {
        ResponseError::new(
            ErrorKind::InvalidInteger,
            rid,
            format!("'{arg}' is not an integer"),
        )
        .with_cause(err)
    })
}

/// Build a shareable generator handle.
pub fn basic() -> Arc<dyn Generator> {
    Arc::new(BasicGenerator)
}
