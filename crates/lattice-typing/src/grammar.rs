//! IDL declaration grammar.
//!
//! Declarations are matched at the regex level:
//! - type header: `struct Name<T1,T2>`, `union U`, `enum E`, `typedef D`
//! - type instance: `Name<var,...>` with nest-aware variable lists
//! - interface members: `interface I`, `property p`, `method m`, `event e`

use std::sync::LazyLock;

use regex::Regex;

pub static TYPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(struct|union|enum|typedef)\s+([\w.]+)(\s*<\s*(.+)\s*>)?$").unwrap()
});

pub static INSTANCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w.]+)(\s*<\s*(.+)\s*>)?$").unwrap());

pub static INTERFACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^interface\s+([\w.]+)$").unwrap());

pub static PROPERTY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^property\s+([\w.]+)$").unwrap());

pub static METHOD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^method\s+([\w.]+)$").unwrap());

pub static EVENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^event\s+([\w.]+)$").unwrap());

/// Split a generic variable list on top-level commas, ignoring commas
/// nested inside `<...>`.
pub fn split_type_list(decl: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut nesting = 0usize;
    let mut start = 0usize;

    for (i, ch) in decl.char_indices() {
        match ch {
            '<' => nesting += 1,
            '>' => nesting = nesting.saturating_sub(1),
            ',' if nesting == 0 => {
                parts.push(decl[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }

    parts.push(decl[start..].trim().to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_header() {
        let caps = TYPE_REGEX.captures("struct Pair<A,B>").unwrap();
        assert_eq!(&caps[1], "struct");
        assert_eq!(&caps[2], "Pair");
        assert_eq!(&caps[4], "A,B");

        let caps = TYPE_REGEX.captures("typedef IntPair").unwrap();
        assert_eq!(&caps[1], "typedef");
        assert!(caps.get(4).is_none());

        assert!(TYPE_REGEX.captures("class Nope").is_none());
    }

    #[test]
    fn test_nested_split() {
        assert_eq!(
            split_type_list("HashMap<string,int64>, List<List<double>>"),
            vec!["HashMap<string,int64>", "List<List<double>>"]
        );
        assert_eq!(split_type_list("A"), vec!["A"]);
    }

    #[test]
    fn test_instance() {
        let caps = INSTANCE_REGEX.captures("com.example.Box<int64>").unwrap();
        assert_eq!(&caps[1], "com.example.Box");
        assert_eq!(&caps[3], "int64");
    }

    #[test]
    fn test_interface_members() {
        assert_eq!(&METHOD_REGEX.captures("method add").unwrap()[1], "add");
        assert_eq!(&PROPERTY_REGEX.captures("property state").unwrap()[1], "state");
        assert_eq!(&EVENT_REGEX.captures("event changed").unwrap()[1], "changed");
        assert_eq!(
            &INTERFACE_REGEX.captures("interface Calculator").unwrap()[1],
            "Calculator"
        );
    }
}
