//! Shader source resolution and preprocessing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use crate::error::SourceError;

/// Version marker of a loaded source, compared to detect edits on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStamp {
    /// File modification time.
    Modified(SystemTime),
    /// Edit counter of an in-memory file.
    Revision(u64),
    /// The file can no longer be found.
    Unknown,
}

/// A loaded shader file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// The logical name it was requested by.
    pub name: String,
    /// Where it was read from; `None` for in-memory sources.
    pub path: Option<PathBuf>,
    pub content: String,
    pub stamp: SourceStamp,
}

/// Looks up shader sources by logical name.
pub trait SourceResolver {
    fn resolve(&self, name: &str) -> Result<SourceFile, SourceError>;

    /// Resolves a name found in an `#include` directive inside `from`.
    fn resolve_include(&self, name: &str, _from: &SourceFile) -> Result<SourceFile, SourceError> {
        self.resolve(name)
    }

    /// Current stamp of a previously loaded file.
    fn stamp(&self, file: &SourceFile) -> SourceStamp;

    /// Whether `file` changed since it was loaded.
    fn is_modified(&self, file: &SourceFile) -> bool {
        self.stamp(file) != file.stamp
    }
}

/// Resolves shader files on disk through an ordered list of search paths.
#[derive(Debug, Clone, Default)]
pub struct FileSystemResolver {
    search_paths: Vec<PathBuf>,
    include_root: Option<PathBuf>,
}

impl FileSystemResolver {
    /// With an `include_root`, includes resolve only under it.
    pub fn new(search_paths: Vec<PathBuf>, include_root: Option<PathBuf>) -> Self {
        Self {
            search_paths,
            include_root,
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Finds the file `name` refers to.
    ///
    /// Absolute paths are taken as they are. Relative names are looked up in
    /// the search paths in order, and only then relative to the working
    /// directory.
    pub fn complete_path(&self, name: &str) -> Result<PathBuf, SourceError> {
        let direct = Path::new(name);
        if direct.is_absolute() {
            if direct.is_file() {
                return Ok(direct.to_path_buf());
            }
            return Err(SourceError::NotFound {
                name: name.to_string(),
                searched: vec![direct.to_path_buf()],
            });
        }
        if let Some(found) = self
            .search_paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
        {
            return Ok(found);
        }
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        Err(SourceError::NotFound {
            name: name.to_string(),
            searched: self.search_paths.clone(),
        })
    }

    fn read(name: &str, path: PathBuf) -> Result<SourceFile, SourceError> {
        let content = fs::read_to_string(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        let stamp = modified(&path);
        Ok(SourceFile {
            name: name.to_string(),
            path: Some(path),
            content,
            stamp,
        })
    }
}

fn modified(path: &Path) -> SourceStamp {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(SourceStamp::Modified)
        .unwrap_or(SourceStamp::Unknown)
}

impl SourceResolver for FileSystemResolver {
    fn resolve(&self, name: &str) -> Result<SourceFile, SourceError> {
        let path = self.complete_path(name)?;
        Self::read(name, path)
    }

    fn resolve_include(&self, name: &str, _from: &SourceFile) -> Result<SourceFile, SourceError> {
        match &self.include_root {
            Some(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    return Err(SourceError::NotFound {
                        name: name.to_string(),
                        searched: vec![root.clone()],
                    });
                }
                Self::read(name, path)
            }
            None => self.resolve(name),
        }
    }

    fn stamp(&self, file: &SourceFile) -> SourceStamp {
        match &file.path {
            Some(path) => modified(path),
            None => SourceStamp::Unknown,
        }
    }
}

/// In-memory sources, e.g. shaders embedded with `include_str!`.
///
/// Clones share the same files, so a handle kept outside the cache can
/// edit sources that the cache later rebuilds from.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    files: Rc<RefCell<HashMap<String, (String, u64)>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryResolver::insert`].
    ///
    /// ```
    /// use phalanx::{MemoryResolver, SourceResolver};
    ///
    /// let files = MemoryResolver::new().with("pass.frag", "@fragment fn fs() {}");
    /// let loaded = files.resolve("pass.frag").unwrap();
    /// assert!(loaded.path.is_none());
    ///
    /// files.insert("pass.frag", "@fragment fn fs() { }");
    /// assert!(files.is_modified(&loaded));
    /// ```
    pub fn with(self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(name, content);
        self
    }

    /// Adds or replaces a file, bumping its revision.
    pub fn insert(&self, name: impl Into<String>, content: impl Into<String>) {
        let mut files = self.files.borrow_mut();
        let entry = files.entry(name.into()).or_insert((String::new(), 0));
        entry.0 = content.into();
        entry.1 += 1;
    }

    /// Returns whether the file existed.
    pub fn remove(&self, name: &str) -> bool {
        self.files.borrow_mut().remove(name).is_some()
    }
}

impl SourceResolver for MemoryResolver {
    fn resolve(&self, name: &str) -> Result<SourceFile, SourceError> {
        let files = self.files.borrow();
        let (content, revision) = files.get(name).ok_or_else(|| SourceError::NotFound {
            name: name.to_string(),
            searched: Vec::new(),
        })?;
        Ok(SourceFile {
            name: name.to_string(),
            path: None,
            content: content.clone(),
            stamp: SourceStamp::Revision(*revision),
        })
    }

    fn stamp(&self, file: &SourceFile) -> SourceStamp {
        self.files
            .borrow()
            .get(&file.name)
            .map(|(_, revision)| SourceStamp::Revision(*revision))
            .unwrap_or(SourceStamp::Unknown)
    }
}

/// Maps lines of preprocessed output back to the file they came from.
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    lines: Vec<(Rc<str>, usize)>,
}

impl LineMap {
    /// Origin of 1-based output line `line`.
    pub fn resolve(&self, line: u32) -> Option<(&str, usize)> {
        let index = (line as usize).checked_sub(1)?;
        self.lines
            .get(index)
            .map(|(file, line)| (file.as_ref(), *line))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A stage source after header insertion and include expansion.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub text: String,
    pub lines: LineMap,
    /// The stage file followed by every file it included.
    pub files: Vec<SourceFile>,
}

/// File name the [`LineMap`] reports for lines of a program header.
pub const HEADER_NAME: &str = "<header>";

/// Prepends `header` and, if asked, expands `#include "file"` directives.
pub fn preprocess(
    resolver: &dyn SourceResolver,
    file: SourceFile,
    header: &str,
    process_includes: bool,
) -> Result<Preprocessed, SourceError> {
    let mut out = Output::default();
    if !header.is_empty() {
        let origin: Rc<str> = Rc::from(HEADER_NAME);
        out.push("// BEGIN HEADER", &origin, 0);
        for (i, line) in header.lines().enumerate() {
            out.push(line, &origin, i + 1);
        }
        out.push("// END HEADER", &origin, 0);
    }

    let mut files = Vec::new();
    let mut stack = Vec::new();
    expand(resolver, &file, process_includes, &mut out, &mut stack, &mut files)?;
    files.insert(0, file);

    Ok(Preprocessed {
        text: out.text,
        lines: out.lines,
        files,
    })
}

#[derive(Default)]
struct Output {
    text: String,
    lines: LineMap,
}

impl Output {
    fn push(&mut self, line: &str, file: &Rc<str>, number: usize) {
        self.text.push_str(line);
        self.text.push('\n');
        self.lines.lines.push((Rc::clone(file), number));
    }
}

fn expand(
    resolver: &dyn SourceResolver,
    file: &SourceFile,
    process_includes: bool,
    out: &mut Output,
    stack: &mut Vec<String>,
    included: &mut Vec<SourceFile>,
) -> Result<(), SourceError> {
    stack.push(file.name.clone());
    let origin: Rc<str> = Rc::from(file.name.as_str());
    for (i, line) in file.content.lines().enumerate() {
        let number = i + 1;
        let directive = if process_includes {
            include_directive(line, &file.name, number)?
        } else {
            None
        };
        let Some(name) = directive else {
            out.push(line, &origin, number);
            continue;
        };
        if stack.iter().any(|open| *open == name) {
            let mut chain = stack.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(&name);
            return Err(SourceError::IncludeCycle { chain });
        }
        let child = resolver.resolve_include(&name, file).inspect_err(|e| {
            log::error!("cannot open shader include `{name}` from {}:{number}: {e}", file.name);
        })?;
        out.push(&format!("// BEGIN INCLUDE {name}"), &origin, number);
        expand(resolver, &child, process_includes, out, stack, included)?;
        out.push(&format!("// END INCLUDE {name}"), &origin, number);
        included.push(child);
    }
    stack.pop();
    Ok(())
}

/// The file named by an `#include` on this line, unless it is commented out.
fn include_directive(line: &str, file: &str, number: usize) -> Result<Option<String>, SourceError> {
    let Some(pos) = line.find("#include") else {
        return Ok(None);
    };
    let before = &line[..pos];
    if before.contains("//") || before.contains("/*") {
        return Ok(None);
    }
    let malformed = || SourceError::MalformedInclude {
        file: file.to_string(),
        line: number,
    };
    let rest = line[pos + "#include".len()..].trim();
    let rest = rest.strip_prefix('"').ok_or_else(malformed)?;
    let end = rest.find('"').ok_or_else(malformed)?;
    let name = &rest[..end];
    if name.is_empty() {
        return Err(malformed());
    }
    Ok(Some(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(resolver: &MemoryResolver, name: &str, header: &str, includes: bool) -> Result<Preprocessed, SourceError> {
        let file = resolver.resolve(name)?;
        preprocess(resolver, file, header, includes)
    }

    #[test]
    fn includes_are_wrapped_in_markers() {
        let resolver = MemoryResolver::new()
            .with("main.wgsl", "// top\n#include \"common.wgsl\"\nfn main() {}")
            .with("common.wgsl", "const PI: f32 = 3.14;");
        let out = load(&resolver, "main.wgsl", "", true).unwrap();
        assert_eq!(
            out.text,
            "// top\n// BEGIN INCLUDE common.wgsl\nconst PI: f32 = 3.14;\n// END INCLUDE common.wgsl\nfn main() {}\n"
        );
        assert_eq!(out.files.len(), 2);
        assert_eq!(out.files[0].name, "main.wgsl");
    }

    #[test]
    fn commented_includes_are_left_alone() {
        let resolver = MemoryResolver::new().with(
            "main.wgsl",
            "// #include \"missing.wgsl\"\n/* #include \"missing.wgsl\" */\nfn main() {}",
        );
        let out = load(&resolver, "main.wgsl", "", true).unwrap();
        assert!(!out.text.contains("BEGIN INCLUDE"));
        assert_eq!(out.lines.len(), 3);
    }

    #[test]
    fn includes_are_kept_verbatim_when_disabled() {
        let resolver = MemoryResolver::new().with("main.wgsl", "#include \"missing.wgsl\"");
        let out = load(&resolver, "main.wgsl", "", false).unwrap();
        assert_eq!(out.text, "#include \"missing.wgsl\"\n");
    }

    #[test]
    fn header_goes_first_and_maps_to_itself() {
        let resolver = MemoryResolver::new().with("main.wgsl", "fn main() {}");
        let out = load(&resolver, "main.wgsl", "const STEPS: i32 = 64;", true).unwrap();
        assert!(out.text.starts_with("// BEGIN HEADER\nconst STEPS: i32 = 64;\n// END HEADER\n"));
        assert_eq!(out.lines.resolve(2), Some((HEADER_NAME, 1)));
        assert_eq!(out.lines.resolve(4), Some(("main.wgsl", 1)));
    }

    #[test]
    fn lines_map_back_through_nested_includes() {
        let resolver = MemoryResolver::new()
            .with("a.wgsl", "line a1\n#include \"b.wgsl\"\nline a3")
            .with("b.wgsl", "line b1\n#include \"c.wgsl\"")
            .with("c.wgsl", "line c1\nline c2");
        let out = load(&resolver, "a.wgsl", "", true).unwrap();
        let text: Vec<&str> = out.text.lines().collect();
        let c2 = text.iter().position(|l| *l == "line c2").unwrap() as u32 + 1;
        assert_eq!(out.lines.resolve(c2), Some(("c.wgsl", 2)));
        let a3 = text.iter().position(|l| *l == "line a3").unwrap() as u32 + 1;
        assert_eq!(out.lines.resolve(a3), Some(("a.wgsl", 3)));
        assert_eq!(out.lines.resolve(0), None);
    }

    #[test]
    fn include_cycles_are_errors() {
        let resolver = MemoryResolver::new()
            .with("a.wgsl", "#include \"b.wgsl\"")
            .with("b.wgsl", "#include \"a.wgsl\"");
        let err = load(&resolver, "a.wgsl", "", true).unwrap_err();
        assert!(matches!(err, SourceError::IncludeCycle { chain } if chain == "a.wgsl -> b.wgsl -> a.wgsl"));
    }

    #[test]
    fn malformed_and_missing_includes_fail() {
        let resolver = MemoryResolver::new()
            .with("bad.wgsl", "\n#include common.wgsl")
            .with("missing.wgsl", "#include \"nowhere.wgsl\"");
        assert!(matches!(
            load(&resolver, "bad.wgsl", "", true),
            Err(SourceError::MalformedInclude { line: 2, .. })
        ));
        assert!(matches!(
            load(&resolver, "missing.wgsl", "", true),
            Err(SourceError::NotFound { name, .. }) if name == "nowhere.wgsl"
        ));
    }

    #[test]
    fn memory_revisions_detect_edits() {
        let resolver = MemoryResolver::new().with("a.wgsl", "one");
        let file = resolver.resolve("a.wgsl").unwrap();
        assert!(!resolver.is_modified(&file));
        resolver.insert("a.wgsl", "two");
        assert!(resolver.is_modified(&file));
    }

    #[test]
    fn search_paths_are_tried_in_order() {
        let root = std::env::temp_dir().join(format!("phalanx-source-{}", std::process::id()));
        let first = root.join("first");
        let second = root.join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("only_second.wgsl"), "second").unwrap();
        fs::write(first.join("both.wgsl"), "first").unwrap();
        fs::write(second.join("both.wgsl"), "second").unwrap();

        let resolver = FileSystemResolver::new(vec![first.clone(), second.clone()], None);
        assert_eq!(resolver.resolve("both.wgsl").unwrap().content, "first");
        assert_eq!(resolver.resolve("only_second.wgsl").unwrap().content, "second");
        assert!(matches!(
            resolver.resolve("none.wgsl"),
            Err(SourceError::NotFound { searched, .. }) if searched.len() == 2
        ));

        let rooted = FileSystemResolver::new(vec![first.clone()], Some(second.clone()));
        let from = rooted.resolve("both.wgsl").unwrap();
        assert_eq!(rooted.resolve_include("both.wgsl", &from).unwrap().content, "second");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn search_paths_win_over_the_working_directory() {
        let name = format!("phalanx-cwd-{}.wgsl", std::process::id());
        let dir = std::env::temp_dir().join(format!("phalanx-shadow-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let local = std::env::current_dir().unwrap().join(&name);
        fs::write(&local, "working directory").unwrap();
        fs::write(dir.join(&name), "search path").unwrap();

        let resolver = FileSystemResolver::new(vec![dir.clone()], None);
        assert_eq!(resolver.resolve(&name).unwrap().content, "search path");

        fs::remove_file(dir.join(&name)).unwrap();
        assert_eq!(resolver.resolve(&name).unwrap().content, "working directory");

        fs::remove_file(&local).ok();
        fs::remove_dir_all(&dir).ok();
    }
}
