//! Loaded IDL documents.

use std::path::PathBuf;

use lattice_core::{Object, ObjectKind, RpcError};

/// A parsed IDL document, registered under its absolute path.
#[derive(Debug)]
pub struct IdlFile {
    pub path: PathBuf,
    /// Decoded document body; streamed verbatim by the typing service.
    pub body: Object,
    pub version: u64,
    pub namespace: Option<String>,
    pub description: Option<String>,
    /// Namespaces in scope for fuzzy type lookups.
    pub uses: Vec<String>,
    /// Raw document text, kept for declaration line lookups.
    source: Option<String>,
}

impl IdlFile {
    /// Parse the `meta` section of a decoded document. A missing or
    /// malformed meta section fails with `EINVAL`.
    pub fn new(
        path: PathBuf,
        body: Object,
        source: Option<String>,
    ) -> Result<Self, RpcError> {
        let meta = body.dict_get("meta").ok_or_else(|| {
            RpcError::invalid(format!(
                "Cannot read meta section of file {}",
                path.display()
            ))
        })?;

        if meta.kind() != ObjectKind::Dictionary {
            return Err(RpcError::invalid(format!(
                "Cannot read meta section of file {}",
                path.display()
            )));
        }

        let version = meta
            .dict_get("version")
            .and_then(|v| v.as_uint64().or_else(|| v.as_int64().map(|i| i as u64)))
            .ok_or_else(|| {
                RpcError::invalid(format!(
                    "Cannot read meta section of file {}",
                    path.display()
                ))
            })?;

        let namespace = meta
            .dict_get("namespace")
            .and_then(|v| v.as_str().map(str::to_string));
        let description = meta
            .dict_get("description")
            .and_then(|v| v.as_str().map(str::to_string));

        let mut uses = Vec::new();
        if let Some(list) = meta.dict_get("use") {
            list.array_apply(|_, item| {
                if let Some(prefix) = item.as_str() {
                    uses.push(prefix.to_string());
                }
                true
            });
        }

        // Stamp each top-level declaration with its source line so
        // diagnostics can point into the document.
        if let Some(source) = &source {
            body.dict_apply(|key, value| {
                if let Some(line) = find_decl_line(source, key) {
                    value.set_line_number(line);
                }
                true
            });
        }

        Ok(Self {
            path,
            body,
            version,
            namespace,
            description,
            uses,
            source,
        })
    }

    /// Qualify a local name with this file's namespace.
    pub fn qualify(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, name),
            None => name.to_string(),
        }
    }

    /// `path:line` of a declaration, using the line stamped on its body
    /// at load time. Falls back to the bare path.
    pub fn origin_for(&self, decl: &Object) -> String {
        match decl.line_number() {
            Some(line) => format!("{}:{}", self.path.display(), line),
            None => self.path.display().to_string(),
        }
    }
}

fn find_decl_line(source: &str, decl: &str) -> Option<u64> {
    for (idx, line) in source.lines().enumerate() {
        if line.trim_end().trim_end_matches(':') == decl {
            return Some(idx as u64 + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::code;

    fn decode(doc: &str) -> Object {
        lattice_core::load("yaml", doc.as_bytes()).unwrap()
    }

    #[test]
    fn test_meta_required() {
        let body = decode("struct Foo:\n  members: {}\n");
        let err = IdlFile::new(PathBuf::from("/x.yaml"), body, None).unwrap_err();
        assert_eq!(err.code, code::EINVAL);
        assert!(err.message.contains("/x.yaml"));
    }

    #[test]
    fn test_meta_parsed() {
        let body = decode(
            "meta:\n  version: 1\n  namespace: com.example\n  use: [com.other]\n",
        );
        let file = IdlFile::new(PathBuf::from("/x.yaml"), body, None).unwrap();
        assert_eq!(file.version, 1);
        assert_eq!(file.namespace.as_deref(), Some("com.example"));
        assert_eq!(file.uses, vec!["com.other"]);
        assert_eq!(file.qualify("Foo"), "com.example.Foo");
    }

    #[test]
    fn test_origin_line() {
        let source = "meta:\n  version: 1\nstruct Foo:\n  members: {}\n";
        let body = decode(source);
        let file =
            IdlFile::new(PathBuf::from("/x.yaml"), body, Some(source.to_string())).unwrap();

        let decl = file.body.dict_get("struct Foo").unwrap();
        assert_eq!(decl.line_number(), Some(3));
        assert_eq!(file.origin_for(&decl), "/x.yaml:3");
        assert_eq!(file.origin_for(&Object::dictionary()), "/x.yaml");
    }
}
