//! Metadata document trimming.
//!
//! The registry's full per-package documents carry readmes, maintainer
//! lists, per-version timestamps, GPG signatures and other fields that a
//! package manager never consults during dependency resolution.  The
//! trimmer rebuilds a document against a fixed whitelist, which typically
//! shrinks it by 30-90%.
//!
//! Anything that does not look like a package-metadata document (no
//! `versions` or no `dist-tags` object) is returned unchanged so that it
//! can be cached verbatim.

use serde_json::{Map, Value};

/// Per-version fields that survive trimming.  `dist` is handled
/// separately because it is itself reduced.
const VERSION_FIELDS: &[&str] = &[
    "name",
    "version",
    "dependencies",
    "optionalDependencies",
    "peerDependencies",
    "peerDependenciesMeta",
    "bin",
    "engines",
    "os",
    "cpu",
];

/// Fields of the `dist` sub-document that survive trimming.
const DIST_FIELDS: &[&str] = &["tarball", "integrity", "shasum"];

/// Trim a metadata document down to its resolution-relevant fields.
///
/// Pure and total: a document without both a `versions` object and a
/// `dist-tags` object is returned as-is, and missing optional fields are
/// simply absent from the output.  The `versions` key order of the input
/// is preserved.  Idempotent: trimming an already-trimmed document yields
/// an identical document.
pub fn trim(doc: &Value) -> Value {
    let Some(obj) = doc.as_object() else {
        return doc.clone();
    };
    let (Some(Value::Object(versions)), Some(dist_tags @ Value::Object(_))) =
        (obj.get("versions"), obj.get("dist-tags"))
    else {
        return doc.clone();
    };

    let mut trimmed_versions = Map::new();
    for (version, entry) in versions {
        trimmed_versions.insert(version.clone(), trim_version(entry));
    }

    let mut out = Map::new();
    if let Some(name) = obj.get("name") {
        out.insert("name".to_string(), name.clone());
    }
    out.insert("dist-tags".to_string(), dist_tags.clone());
    out.insert("versions".to_string(), Value::Object(trimmed_versions));
    Value::Object(out)
}

fn trim_version(entry: &Value) -> Value {
    let Some(fields) = entry.as_object() else {
        return entry.clone();
    };

    let mut out = Map::new();
    for key in VERSION_FIELDS {
        if let Some(value) = fields.get(*key) {
            out.insert((*key).to_string(), value.clone());
        }
    }
    if let Some(dist) = fields.get("dist") {
        out.insert("dist".to_string(), trim_dist(dist));
    }
    Value::Object(out)
}

fn trim_dist(dist: &Value) -> Value {
    let Some(fields) = dist.as_object() else {
        return dist.clone();
    };

    let mut out = Map::new();
    for key in DIST_FIELDS {
        if let Some(value) = fields.get(*key) {
            out.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_doc() -> Value {
        json!({
            "name": "express",
            "description": "Fast, unopinionated web framework",
            "readme": "# express\n\nlots of prose",
            "maintainers": [{"name": "someone", "email": "someone@example.com"}],
            "time": {"created": "2010-12-29T19:38:25.450Z"},
            "dist-tags": {"latest": "4.18.2", "next": "5.0.0-beta.1"},
            "versions": {
                "4.18.2": {
                    "name": "express",
                    "version": "4.18.2",
                    "description": "per-version prose",
                    "dependencies": {"accepts": "~1.3.8", "body-parser": "1.20.1"},
                    "peerDependenciesMeta": {"router": {"optional": true}},
                    "engines": {"node": ">= 0.10.0"},
                    "scripts": {"test": "mocha"},
                    "gitHead": "abc123",
                    "dist": {
                        "tarball": "https://registry.npmjs.org/express/-/express-4.18.2.tgz",
                        "integrity": "sha512-aaa",
                        "shasum": "bbb",
                        "signatures": [{"keyid": "SHA256:x", "sig": "y"}],
                        "npm-signature": "-----BEGIN PGP SIGNATURE-----"
                    }
                },
                "5.0.0-beta.1": {
                    "name": "express",
                    "version": "5.0.0-beta.1",
                    "dependencies": {"router": "^1.3.5"},
                    "_npmOperationalInternal": {"host": "s3://bucket"}
                }
            }
        })
    }

    #[test]
    fn drops_top_level_prose() {
        let trimmed = trim(&full_doc());
        let keys: Vec<&String> = trimmed.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["name", "dist-tags", "versions"]);
    }

    #[test]
    fn version_fields_are_whitelisted() {
        let trimmed = trim(&full_doc());
        let entry = &trimmed["versions"]["4.18.2"];
        let allowed: Vec<&str> = VERSION_FIELDS.iter().copied().chain(["dist"]).collect();
        for key in entry.as_object().unwrap().keys() {
            assert!(allowed.contains(&key.as_str()), "unexpected field: {key}");
        }
        assert!(entry.get("scripts").is_none());
        assert!(entry.get("gitHead").is_none());
    }

    #[test]
    fn dist_is_reduced() {
        let trimmed = trim(&full_doc());
        let dist = trimmed["versions"]["4.18.2"]["dist"].as_object().unwrap();
        let keys: Vec<&String> = dist.keys().collect();
        assert_eq!(keys, ["tarball", "integrity", "shasum"]);
    }

    #[test]
    fn missing_dist_stays_missing() {
        let trimmed = trim(&full_doc());
        assert!(trimmed["versions"]["5.0.0-beta.1"].get("dist").is_none());
    }

    #[test]
    fn version_key_order_is_preserved() {
        let doc = json!({
            "name": "ordered",
            "dist-tags": {"latest": "0.3.0"},
            "versions": {
                "0.3.0": {"version": "0.3.0"},
                "0.1.0": {"version": "0.1.0"},
                "0.2.0": {"version": "0.2.0"}
            }
        });
        let trimmed = trim(&doc);
        let keys: Vec<&String> = trimmed["versions"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["0.3.0", "0.1.0", "0.2.0"]);
    }

    #[test]
    fn idempotent() {
        let once = trim(&full_doc());
        let twice = trim(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_metadata_passes_through() {
        let error_body = json!({"error": "Not found"});
        assert_eq!(trim(&error_body), error_body);

        let no_dist_tags = json!({"name": "x", "versions": {}});
        assert_eq!(trim(&no_dist_tags), no_dist_tags);

        let no_versions = json!({"name": "x", "dist-tags": {}});
        assert_eq!(trim(&no_versions), no_versions);

        let scalar = json!("just a string");
        assert_eq!(trim(&scalar), scalar);
    }

    #[test]
    fn dist_tags_are_kept_verbatim() {
        let trimmed = trim(&full_doc());
        assert_eq!(
            trimmed["dist-tags"],
            json!({"latest": "4.18.2", "next": "5.0.0-beta.1"})
        );
    }

    #[test]
    fn non_object_version_entry_is_kept() {
        let doc = json!({
            "dist-tags": {"latest": "1.0.0"},
            "versions": {"1.0.0": "unpublished"}
        });
        let trimmed = trim(&doc);
        assert_eq!(trimmed["versions"]["1.0.0"], json!("unpublished"));
    }
}
