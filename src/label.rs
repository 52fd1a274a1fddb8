//! Build labels: the canonical identity of a target or a
//! package-wildcard (`spec.md` §3.1, §4.1).

use std::fmt;

use crate::error::CoreError;
use crate::interning::InternedString;

/// Wildcard target name meaning "every package at or below here".
pub const ALL_TARGETS: &str = "...";
/// Wildcard target name meaning "every target in this exact package".
pub const ALL_IN_PACKAGE: &str = "all";

const RESERVED_NAME_SUFFIXES: [&str; 2] = ["._build", "._test"];
const RESERVED_NAMES: [&str; 2] = [".", ".."];

/// A parsed `//pkg/sub:name` style identifier.
///
/// Two labels are equal iff `subrepo`, `package_name` and `name` are
/// all equal byte-for-byte; there is deliberately no normalisation at
/// comparison time, only at parse time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildLabel {
    subrepo: InternedString,
    package_name: InternedString,
    name: InternedString,
}

impl BuildLabel {
    fn new_unchecked(subrepo: &str, package_name: &str, name: &str) -> BuildLabel {
        BuildLabel {
            subrepo: InternedString::new(subrepo),
            package_name: InternedString::new(package_name),
            name: InternedString::new(name),
        }
    }

    pub fn subrepo(&self) -> &str {
        self.subrepo.as_str()
    }

    pub fn package_name(&self) -> &str {
        self.package_name.as_str()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn is_all_targets(&self) -> bool {
        self.name.as_str() == ALL_TARGETS
    }

    pub fn is_all_in_package(&self) -> bool {
        self.name.as_str() == ALL_IN_PACKAGE
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_all_targets() || self.is_all_in_package()
    }

    /// Parse `text` as a label, resolving relative forms (`:name`,
    /// bare package paths) against `current_pkg`/`current_subrepo`.
    pub fn parse(
        text: &str,
        current_pkg: Option<&str>,
        current_subrepo: Option<&str>,
    ) -> Result<BuildLabel, CoreError> {
        parse_label(text, current_pkg, current_subrepo, false)
    }

    /// Command-line variant: in addition to `parse`'s forms, accepts a
    /// bare directory path (`src/foo`), whose implicit name is the
    /// last path component.
    pub fn parse_maybe_relative(
        text: &str,
        current_pkg: Option<&str>,
    ) -> Result<BuildLabel, CoreError> {
        parse_label(text, current_pkg, None, true)
    }

    /// Parse, panicking on malformed input. Reserved for contexts
    /// (tests, labels already validated by the parser) where the text
    /// is known-good.
    pub fn must_parse(text: &str) -> BuildLabel {
        Self::parse(text, None, None)
            .unwrap_or_else(|e| panic!("must_parse({text:?}) failed: {e}"))
    }

    /// True iff `self` denotes a wildcard that includes `other`, or
    /// `self == other`.
    pub fn includes(&self, other: &BuildLabel) -> bool {
        if self.subrepo != other.subrepo {
            return false;
        }
        if self.is_all_targets() {
            return other.package_name.as_str() == self.package_name.as_str()
                || is_descendant_package(self.package_name.as_str(), other.package_name.as_str());
        }
        if self.is_all_in_package() {
            return other.package_name.as_str() == self.package_name.as_str();
        }
        self == other
    }

    /// The human-written parent of an internally generated child
    /// target: strips one leading `_` and one trailing `#suffix` from
    /// the name. A label with neither pattern is its own parent.
    pub fn parent(&self) -> BuildLabel {
        let name = self.name.as_str();
        let without_suffix = match name.rfind('#') {
            Some(idx) => &name[..idx],
            None => name,
        };
        let without_prefix = without_suffix.strip_prefix('_').unwrap_or(without_suffix);
        if without_prefix == name {
            *self
        } else {
            BuildLabel::new_unchecked(self.subrepo.as_str(), self.package_name.as_str(), without_prefix)
        }
    }

    /// Deterministic total order: subrepo, then package, then name.
    pub fn less(&self, other: &BuildLabel) -> bool {
        self.cmp(other) == std::cmp::Ordering::Less
    }
}

fn is_descendant_package(ancestor: &str, candidate: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    candidate
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

impl PartialOrd for BuildLabel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildLabel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.subrepo.as_str(), self.package_name.as_str(), self.name.as_str()).cmp(&(
            other.subrepo.as_str(),
            other.package_name.as_str(),
            other.name.as_str(),
        ))
    }
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.subrepo.is_empty() {
            write!(f, "@{}", self.subrepo)?;
        }
        write!(f, "//{}:{}", self.package_name, self.name)
    }
}

impl fmt::Debug for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildLabel({self})")
    }
}

fn validate_name(text: &str, name: &str) -> Result<(), CoreError> {
    let bad = |reason: &str| CoreError::ParseError {
        text: text.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(bad("empty target name"));
    }
    if name.contains('/') || name.contains(':') || name.contains('|') {
        return Err(bad("target name may not contain '/', ':' or '|'"));
    }
    if RESERVED_NAMES.contains(&name) && name != ALL_TARGETS {
        return Err(bad("target name may not be '.' or '..'"));
    }
    if RESERVED_NAME_SUFFIXES.iter().any(|suf| name.ends_with(suf)) {
        return Err(bad("target name may not end in '._build' or '._test'"));
    }
    Ok(())
}

fn validate_package_name(text: &str, package_name: &str) -> Result<(), CoreError> {
    if package_name.starts_with('/') || package_name.ends_with('/') {
        return Err(CoreError::ParseError {
            text: text.to_string(),
            reason: "package path may not have a leading or trailing slash".to_string(),
        });
    }
    if package_name.contains("//") {
        return Err(CoreError::ParseError {
            text: text.to_string(),
            reason: "package path may not contain a double slash".to_string(),
        });
    }
    Ok(())
}

/// Strips a `@subrepo//...` or `///subrepo//...` prefix, returning the
/// subrepo name (possibly empty) and the remainder of the text.
fn split_subrepo(text: &str) -> (Option<&str>, &str) {
    if let Some(rest) = text.strip_prefix("///") {
        match rest.find("//") {
            Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
            None => (Some(rest), "//"),
        }
    } else if let Some(rest) = text.strip_prefix('@') {
        match rest.find("//") {
            Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
            None => (Some(rest), "//"),
        }
    } else {
        (None, text)
    }
}

fn parse_label(
    text: &str,
    current_pkg: Option<&str>,
    current_subrepo: Option<&str>,
    maybe_relative: bool,
) -> Result<BuildLabel, CoreError> {
    let err = |reason: &str| CoreError::ParseError {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    let (subrepo_part, rest) = split_subrepo(text);
    let subrepo = subrepo_part.unwrap_or(current_subrepo.unwrap_or(""));

    if let Some(body) = rest.strip_prefix("//") {
        let (pkg_part, name_part) = match body.find(':') {
            Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
            None => (body, None),
        };
        validate_package_name(text, pkg_part)?;

        let (annot_name, annot) = split_annotation(name_part.unwrap_or(""));
        let name = if let Some(n) = name_part {
            if n.is_empty() {
                return Err(err("label has a trailing ':' with no name"));
            }
            annot_name.to_string()
        } else if pkg_part.ends_with("/...") || pkg_part == ALL_TARGETS {
            ALL_TARGETS.to_string()
        } else {
            // //pkg/sub -> implicit name is the last path component.
            pkg_part
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(pkg_part)
                .to_string()
        };

        let pkg_part = if name_part.is_none() && pkg_part == ALL_TARGETS {
            ""
        } else if name_part.is_none() && pkg_part.ends_with("/...") {
            pkg_part.trim_end_matches("/...").trim_end_matches("...")
        } else {
            pkg_part
        };

        if !name.is_empty() && name != ALL_TARGETS {
            validate_name(text, &name)?;
        }
        let _ = annot; // annotated labels are represented by BuildInput, not BuildLabel.
        return Ok(BuildLabel::new_unchecked(subrepo, pkg_part, &name));
    }

    if let Some(name_part) = rest.strip_prefix(':') {
        let pkg = current_pkg.ok_or_else(|| err("relative label `:name` used with no current package"))?;
        let (name, _annot) = split_annotation(name_part);
        validate_name(text, name)?;
        return Ok(BuildLabel::new_unchecked(subrepo, pkg, name));
    }

    if maybe_relative {
        let pkg = current_pkg.ok_or_else(|| err("relative path used with no current package"))?;
        let full_pkg = if rest.is_empty() {
            pkg.to_string()
        } else if pkg.is_empty() {
            rest.to_string()
        } else {
            format!("{pkg}/{rest}")
        };
        let name = full_pkg
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&full_pkg)
            .to_string();
        validate_name(text, &name)?;
        return Ok(BuildLabel::new_unchecked(subrepo, &full_pkg, &name));
    }

    Err(err("label must start with '//' or ':'"))
}

/// Splits a `name|annot` suffix off a textual target name. The
/// `BuildLabel` itself never carries the annotation (it identifies a
/// target, not an output group); callers that need the annotation
/// (the `BuildInput::AnnotatedOutputLabel` variant) call this
/// directly.
pub fn split_annotation(name: &str) -> (&str, Option<&str>) {
    match name.find('|') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}
