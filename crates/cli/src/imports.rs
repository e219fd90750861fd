//! Import preprocessor
//!
//! Resolves `import { a, b }` headers before compilation. Each identifier
//! names a sibling `<identifier>.salmon` file; imports are inlined
//! transitively in a stable post-order (a file's imports always precede
//! it), deduplicated across the whole graph, with the importing file's
//! post-import body last. Every inlined section is preceded by a
//! `___path____ ~<path>` marker line so compile and runtime errors report
//! the right file and line.
//!
//! A file with no import header is returned byte-for-byte unmodified.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn preprocess(path: &Path) -> io::Result<String> {
    let source = read_source(path)?;
    let Some((imports, body)) = split_import_block(&source)? else {
        return Ok(source);
    };

    let mut visited = HashSet::new();
    visited.insert(canonical(path));
    let dir = parent_dir(path);

    let mut out = String::new();
    for name in imports {
        resolve_into(&dir.join(format!("{name}.salmon")), &mut visited, &mut out)?;
    }
    push_section(&mut out, path, body);
    Ok(out)
}

fn resolve_into(path: &Path, visited: &mut HashSet<PathBuf>, out: &mut String) -> io::Result<()> {
    if !visited.insert(canonical(path)) {
        return Ok(());
    }
    let source = read_source(path)?;
    let dir = parent_dir(path);
    match split_import_block(&source)? {
        Some((imports, body)) => {
            for name in imports {
                resolve_into(&dir.join(format!("{name}.salmon")), visited, out)?;
            }
            push_section(out, path, body);
        }
        None => push_section(out, path, &source),
    }
    Ok(())
}

fn read_source(path: &Path) -> io::Result<String> {
    fs::read_to_string(path).map_err(|error| {
        io::Error::new(
            error.kind(),
            format!("Could not open file \"{}\".", path.display()),
        )
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Canonical identity for deduplication; falls back to the literal path
/// when the file does not resolve (the read that follows reports it).
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn push_section(out: &mut String, path: &Path, body: &str) {
    out.push_str(&format!("___path____ ~{}\n", canonical(path).display()));
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
}

/// Split a leading `import { a, b }` header from the rest of the source.
/// Returns `None` when the file does not start with an import directive.
fn split_import_block(source: &str) -> io::Result<Option<(Vec<String>, &str)>> {
    let trimmed = source.trim_start();
    let Some(after_keyword) = trimmed.strip_prefix("import") else {
        return Ok(None);
    };
    // 'import' must be a whole word followed by a block; anything else
    // (an identifier like 'imports', a call) is ordinary source text.
    let after_keyword = after_keyword.trim_start();
    if !after_keyword.starts_with('{') {
        return Ok(None);
    }
    let inner = &after_keyword[1..];
    let Some(close) = inner.find('}') else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Import block is missing '}'.",
        ));
    };
    let names = inner[..close]
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Some((names, &inner[close + 1..])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_no_import_block_is_identity() {
        let dir = TempDir::new().unwrap();
        let main = write(&dir, "main.salmon", "var a := 1;\n_print(a);\n");
        let combined = preprocess(&main).unwrap();
        assert_eq!(combined, "var a := 1;\n_print(a);\n");
        assert!(!combined.contains("___path____"));
    }

    #[test]
    fn test_identifier_starting_with_import_is_not_a_directive() {
        let dir = TempDir::new().unwrap();
        let main = write(&dir, "main.salmon", "imports();\n");
        assert_eq!(preprocess(&main).unwrap(), "imports();\n");
    }

    #[test]
    fn test_single_import_inlines_with_markers() {
        let dir = TempDir::new().unwrap();
        write(&dir, "util.salmon", "fun helper() { return 1; }\n");
        let main = write(&dir, "main.salmon", "import { util }\n_print(helper());\n");

        let combined = preprocess(&main).unwrap();
        let helper_at = combined.find("fun helper").unwrap();
        let body_at = combined.find("_print(helper());").unwrap();
        assert!(helper_at < body_at, "imported file must precede the body");
        assert_eq!(combined.matches("___path____ ~").count(), 2);
        assert!(combined.contains("util.salmon"));
        assert!(combined.contains("main.salmon"));
    }

    #[test]
    fn test_diamond_import_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        write(&dir, "shared.salmon", "var shared := 0;\n");
        write(&dir, "a.salmon", "import { shared }\nvar a := 1;\n");
        write(&dir, "b.salmon", "import { shared }\nvar b := 2;\n");
        let main = write(&dir, "main.salmon", "import { a, b }\nvar main := 3;\n");

        let combined = preprocess(&main).unwrap();
        assert_eq!(combined.matches("var shared := 0;").count(), 1);
        let shared_at = combined.find("var shared").unwrap();
        let a_at = combined.find("var a").unwrap();
        let b_at = combined.find("var b").unwrap();
        let main_at = combined.find("var main").unwrap();
        assert!(shared_at < a_at && a_at < b_at && b_at < main_at);
    }

    #[test]
    fn test_cyclic_imports_terminate() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.salmon", "import { b }\nvar a := 1;\n");
        write(&dir, "b.salmon", "import { a }\nvar b := 2;\n");
        let main = write(&dir, "main.salmon", "import { a }\nvar main := 3;\n");

        let combined = preprocess(&main).unwrap();
        assert_eq!(combined.matches("var a := 1;").count(), 1);
        assert_eq!(combined.matches("var b := 2;").count(), 1);
        // b's body lands before a's: a's import of b resolves first.
        assert!(combined.find("var b").unwrap() < combined.find("var a").unwrap());
    }

    #[test]
    fn test_missing_import_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let main = write(&dir, "main.salmon", "import { nope }\n");
        let error = preprocess(&main).unwrap_err();
        assert!(error.to_string().contains("nope.salmon"));
    }

    #[test]
    fn test_unclosed_import_block_is_an_error() {
        let dir = TempDir::new().unwrap();
        let main = write(&dir, "main.salmon", "import { a, b\nvar x := 1;\n");
        let error = preprocess(&main).unwrap_err();
        assert!(error.to_string().contains("missing '}'"));
    }
}
