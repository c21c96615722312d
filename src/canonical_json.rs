// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Canonical JSON, the byte-exact serialization Matrix signs and verifies.
//!
//! Objects are emitted with their keys sorted by raw codepoint order, arrays
//! keep their element order, and no whitespace is produced. The signable
//! form of an event additionally has its `signatures` and `unsigned` members
//! removed before serialization.

use serde_json::Value;

/// Serialize a JSON value into its canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::with_capacity(256);
    write_value(value, &mut out);
    out
}

/// Serialize the signable canonical form of a JSON object.
///
/// The top level `signatures` and `unsigned` members are skipped; the given
/// value is not mutated, so callers keep seeing both members afterwards.
pub fn canonical_signable_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut out = String::with_capacity(256);
            let mut keys: Vec<&String> =
                map.keys().filter(|k| *k != "signatures" && *k != "unsigned").collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, &mut out);
                out.push(':');
                write_value(&map[key.as_str()], &mut out);
            }
            out.push('}');
            out
        }
        other => canonical_json(other),
    }
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(values) => {
            out.push('[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(v, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json handles the escaping rules.
    out.push_str(&serde_json::to_string(s).expect("strings always serialize"));
}
