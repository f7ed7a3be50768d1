//! Directive preprocessor: drives a per-file line scan, recognizes `#`
//! directives, keeps a stack of nested conditional frames, hands expression
//! text to the [`ExpressionEvaluator`] and macro text to the [`MacroTable`],
//! and assembles the surviving lines into the output buffer.
//!
//! All file access goes through the caller-supplied [`FileCallback`]; the
//! core never touches the filesystem itself. Processing is synchronous and
//! runs to completion or to a terminal error; on failure the output buffer
//! must be discarded and the diagnostic pulled via
//! [`Preprocessor::last_error`].

use std::fs::File;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{PreshadeError, PreshadeResult};
use crate::eval::{ExpressionEvaluator, FuncRegistry};
use crate::scan::{first_identifier, is_valid_identifier, strip_comments};
use crate::substitute::MacroTable;

/// File-open/read abstraction consumed by the preprocessor for the initial
/// file and every `#include` target.
pub trait FileCallback {
    fn open(&mut self, name: &str) -> bool;
    fn close(&mut self);
    fn size(&self) -> u32;
    fn read(&mut self, max_len: u32, dst: &mut [u8]) -> u32;
}

/// Default [`FileCallback`] backed by `std::fs`, resolving names against an
/// optional root directory.
#[derive(Debug, Default)]
pub struct FsFileCallback {
    root: Option<PathBuf>,
    file: Option<File>,
    size: u32,
}

impl FsFileCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            file: None,
            size: 0,
        }
    }
}

impl FileCallback for FsFileCallback {
    fn open(&mut self, name: &str) -> bool {
        let path = match &self.root {
            Some(root) => root.join(name),
            None => PathBuf::from(name),
        };
        match File::open(&path) {
            Ok(file) => {
                self.size = file
                    .metadata()
                    .map(|m| u32::try_from(m.len()).unwrap_or(u32::MAX))
                    .unwrap_or(0);
                self.file = Some(file);
                true
            }
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        self.file = None;
        self.size = 0;
    }

    fn size(&self) -> u32 {
        if self.file.is_some() { self.size } else { 0 }
    }

    fn read(&mut self, max_len: u32, dst: &mut [u8]) -> u32 {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let want = (max_len as usize).min(dst.len());
        let mut done = 0;
        while done < want {
            match file.read(&mut dst[done..want]) {
                Ok(0) | Err(_) => break,
                Ok(n) => done += n,
            }
        }
        done as u32
    }
}

/// One surviving output line: source line number plus its macro-expanded
/// text. Ordered, write-once; consumed by the final assembly.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SourceLine {
    pub number: u32,
    pub text: String,
}

/// One open `#if`/`#ifdef`/`#ifndef` region. `effective_condition` is the OR
/// of this branch's condition and all prior sibling branches' conditions in
/// the same chain; the first true branch wins.
struct CondFrame {
    effective_condition: bool,
    do_skip_lines: bool,
}

impl CondFrame {
    fn open(condition: bool) -> Self {
        Self {
            effective_condition: condition,
            do_skip_lines: !condition,
        }
    }

    /// Base frame for the top level of a file; never popped.
    fn sentinel() -> Self {
        Self {
            effective_condition: true,
            do_skip_lines: false,
        }
    }
}

/// Text-macro preprocessor for shader-style source.
///
/// The macro table and the numeric variable environment persist across
/// [`process`](Self::process)/[`process_file`](Self::process_file) calls on
/// the same instance until [`clear`](Self::clear), so a caller can build up a
/// base macro environment once and preprocess several source variants
/// against it. Instances are not safe for concurrent invocation; use one
/// instance per worker.
pub struct Preprocessor {
    file_cb: Box<dyn FileCallback>,
    evaluator: ExpressionEvaluator,
    macros: MacroTable,
    cur_file: String,
    last_error: Option<PreshadeError>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::with_file_callback(Box::new(FsFileCallback::new()))
    }

    pub fn with_file_callback(file_cb: Box<dyn FileCallback>) -> Self {
        Self {
            file_cb,
            evaluator: ExpressionEvaluator::with_functions(Arc::new(FuncRegistry::common())),
            macros: MacroTable::new(),
            cur_file: String::new(),
            last_error: None,
        }
    }

    /// Opens `name` through the file callback and preprocesses its contents
    /// into `output`. On `false` the output buffer holds nothing usable and
    /// the diagnostic is available from [`last_error`](Self::last_error).
    #[tracing::instrument(skip(self, output))]
    pub fn process_file(&mut self, name: &str, output: &mut String) -> bool {
        self.run(output, |pp, lines| {
            let text = pp.read_source(name)?;
            pp.cur_file = name.to_string();
            pp.process_text(&text, lines)
        })
    }

    /// Preprocesses in-memory source text into `output`.
    #[tracing::instrument(skip(self, source, output))]
    pub fn process(&mut self, source: &str, output: &mut String) -> bool {
        self.run(output, |pp, lines| {
            pp.cur_file = "<source>".to_string();
            pp.process_text(source, lines)
        })
    }

    /// Like [`process`](Self::process) but returns the surviving lines with
    /// their source line numbers instead of a flattened buffer.
    pub fn process_lines(&mut self, source: &str) -> PreshadeResult<Vec<SourceLine>> {
        self.last_error = None;
        self.cur_file = "<source>".to_string();
        let mut lines = Vec::new();
        self.process_text(source, &mut lines)?;
        Ok(lines)
    }

    /// Seeds a macro definition, exactly as a `#define` line would.
    pub fn add_define(&mut self, name: &str, value: &str) -> bool {
        match self.process_define(name, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, name, "add_define failed");
                self.last_error = Some(e);
                false
            }
        }
    }

    /// Drops the macro table and the numeric variable environment.
    pub fn clear(&mut self) {
        self.macros.clear();
        self.evaluator.clear_variables();
        self.last_error = None;
    }

    /// The diagnostic from the most recent failed call; `None` when the last
    /// call succeeded.
    pub fn last_error(&self) -> Option<&PreshadeError> {
        self.last_error.as_ref()
    }

    pub fn has_define(&self, name: &str) -> bool {
        self.macros.contains(name)
    }

    pub fn define_text(&self, name: &str) -> Option<&str> {
        self.macros.get(name)
    }

    /// Whether `name` currently has a numeric value visible to `#if`.
    pub fn has_variable(&self, name: &str) -> bool {
        self.evaluator.has_variable(name)
    }

    fn run(
        &mut self,
        output: &mut String,
        body: impl FnOnce(&mut Self, &mut Vec<SourceLine>) -> PreshadeResult<()>,
    ) -> bool {
        self.last_error = None;
        let mut lines = Vec::new();
        match body(self, &mut lines) {
            Ok(()) => {
                generate_output(output, &lines);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, file = %self.cur_file, "preprocessing failed");
                output.clear();
                self.last_error = Some(e);
                false
            }
        }
    }

    fn read_source(&mut self, name: &str) -> PreshadeResult<String> {
        if !self.file_cb.open(name) {
            return Err(PreshadeError::io(format!("failed to open \"{name}\"")));
        }
        let size = self.file_cb.size();
        let mut buf = vec![0u8; size as usize];
        let got = self.file_cb.read(size, &mut buf) as usize;
        buf.truncate(got);
        self.file_cb.close();
        String::from_utf8(buf)
            .map_err(|_| PreshadeError::io(format!("\"{name}\" is not valid UTF-8")))
    }

    /// Comment-strips `raw`, then scans it line by line, appending surviving
    /// lines (with one macro-substitution pass each) to `lines`. `#include`
    /// recurses into this same routine, flattening inline.
    fn process_text(&mut self, raw: &str, lines: &mut Vec<SourceLine>) -> PreshadeResult<()> {
        let stripped = strip_comments(raw)?;

        let mut frames = vec![CondFrame::sentinel()];

        for (idx, line) in stripped.lines().enumerate() {
            let number = (idx + 1) as u32;
            let skipping = frames.iter().any(|f| f.do_skip_lines);
            let trimmed = line.trim_start_matches([' ', '\t']);

            if let Some(directive) = trimmed.strip_prefix('#') {
                self.handle_directive(directive, number, skipping, &mut frames, lines)?;
            } else if !skipping {
                lines.push(SourceLine {
                    number,
                    text: self.macros.expand(line),
                });
            }
        }

        Ok(())
    }

    /// One `#` line. Conditional directives are processed even while lines
    /// are being skipped (nesting must stay balanced); everything else is
    /// ignored in skipped regions.
    fn handle_directive(
        &mut self,
        directive: &str,
        number: u32,
        skipping: bool,
        frames: &mut Vec<CondFrame>,
        lines: &mut Vec<SourceLine>,
    ) -> PreshadeResult<()> {
        let keyword_end = directive
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(directive.len());
        let keyword = &directive[..keyword_end];
        let args = &directive[keyword_end..];

        match keyword {
            "include" if !skipping => {
                let path = Self::include_path(args)?.to_string();
                self.process_include(&path, lines)
            }
            "define" if !skipping => {
                let (name, value) = Self::name_and_value(args).ok_or_else(|| {
                    PreshadeError::directive(format!(
                        "{}:{}: #define requires a name and a value",
                        self.cur_file, number
                    ))
                })?;
                self.process_define(name, value)
            }
            "ensuredefined" if !skipping => {
                let (name, value) = Self::name_and_value(args).ok_or_else(|| {
                    PreshadeError::directive(format!(
                        "{}:{}: #ensuredefined requires a name and a value",
                        self.cur_file, number
                    ))
                })?;
                // First definition wins.
                if self.evaluator.has_variable(name) {
                    return Ok(());
                }
                self.process_define(name, value)
            }
            "undef" if !skipping => {
                let name = first_identifier(args).ok_or_else(|| {
                    PreshadeError::directive(format!(
                        "{}:{}: #undef requires an identifier",
                        self.cur_file, number
                    ))
                })?;
                self.evaluator.remove_variable(name);
                self.macros.undefine(name);
                Ok(())
            }
            "ifdef" => {
                let name = first_identifier(args).ok_or_else(|| {
                    PreshadeError::directive(format!(
                        "{}:{}: #ifdef requires an identifier",
                        self.cur_file, number
                    ))
                })?;
                frames.push(CondFrame::open(self.evaluator.has_variable(name)));
                Ok(())
            }
            "ifndef" => {
                let name = first_identifier(args).ok_or_else(|| {
                    PreshadeError::directive(format!(
                        "{}:{}: #ifndef requires an identifier",
                        self.cur_file, number
                    ))
                })?;
                frames.push(CondFrame::open(!self.evaluator.has_variable(name)));
                Ok(())
            }
            "if" => {
                let condition = self.eval_condition(args, number)?;
                frames.push(CondFrame::open(condition));
                Ok(())
            }
            "elif" => {
                // Evaluated even when a prior branch already matched, so the
                // same undefined-symbol errors surface either way.
                let condition = self.eval_condition(args, number)?;
                if frames.len() <= 1 {
                    return Err(PreshadeError::directive(format!(
                        "{}:{}: #elif without matching #if",
                        self.cur_file, number
                    )));
                }
                if let Some(top) = frames.last_mut() {
                    top.do_skip_lines = if top.effective_condition {
                        true
                    } else {
                        !condition
                    };
                    top.effective_condition |= condition;
                }
                Ok(())
            }
            "else" => {
                if frames.len() <= 1 {
                    return Err(PreshadeError::directive(format!(
                        "{}:{}: #else without matching #if",
                        self.cur_file, number
                    )));
                }
                if let Some(top) = frames.last_mut() {
                    top.do_skip_lines = top.effective_condition;
                }
                Ok(())
            }
            "endif" => {
                if frames.len() <= 1 {
                    return Err(PreshadeError::directive(format!(
                        "{}:{}: #endif without matching #if",
                        self.cur_file, number
                    )));
                }
                frames.pop();
                Ok(())
            }
            _ if skipping => Ok(()),
            other => Err(PreshadeError::directive(format!(
                "{}:{}: unknown preprocessor directive \"#{other}\"",
                self.cur_file, number
            ))),
        }
    }

    fn eval_condition(&mut self, expr: &str, number: u32) -> PreshadeResult<bool> {
        match self.evaluator.evaluate(expr) {
            Ok(v) => Ok(v != 0.0),
            Err(_) => {
                let report = self.evaluator.last_error_report().unwrap_or_default();
                Err(PreshadeError::expression(format!(
                    "{}:{}: {report}",
                    self.cur_file, number
                )))
            }
        }
    }

    fn process_include(&mut self, name: &str, lines: &mut Vec<SourceLine>) -> PreshadeResult<()> {
        tracing::debug!(file = name, "including");
        let text = self.read_source(name)?;
        let prev_file = std::mem::replace(&mut self.cur_file, name.to_string());
        let result = self.process_text(&text, lines);
        self.cur_file = prev_file;
        result
    }

    /// `#define` both ways: the raw value is evaluated for the numeric
    /// variable table (silently skipped when it does not evaluate), and the
    /// macro-expanded value is stored as replacement text. A name whose old
    /// numeric value exists but whose new value does not evaluate keeps the
    /// stale number; the original behaves the same way.
    fn process_define(&mut self, name: &str, value: &str) -> PreshadeResult<()> {
        if !is_valid_identifier(name) {
            return Err(PreshadeError::directive(format!(
                "invalid identifier \"{name}\""
            )));
        }

        if let Ok(v) = self.evaluator.evaluate(value) {
            self.evaluator.set_variable(name, v);
        }

        let expanded = self.macros.expand(value);
        self.macros.define(name, expanded);
        Ok(())
    }

    /// Extracts the quoted target of an `#include`.
    fn include_path(args: &str) -> PreshadeResult<&str> {
        let open = args.find('"').ok_or_else(|| {
            PreshadeError::directive("#include does not contain a filename in double quotes")
        })?;
        let rest = &args[open + 1..];
        let close = rest.find('"').ok_or_else(|| {
            PreshadeError::directive("#include contains unterminated double quotes")
        })?;
        Ok(&rest[..close])
    }

    /// Splits `NAME value` for `#define`/`#ensuredefined`. The value is the
    /// first whitespace-delimited token, except that spaces inside
    /// parentheses do not terminate it (`(a + b)` stays whole); trailing text
    /// after the value is discarded.
    fn name_and_value(args: &str) -> Option<(&str, &str)> {
        let s = args.trim_start_matches([' ', '\t']);
        let name_end = s.find([' ', '\t'])?;
        let name = &s[..name_end];

        let rest = s[name_end..].trim_start_matches([' ', '\t']);
        let mut depth = 0i32;
        let mut end = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                ' ' if depth <= 0 => {
                    end = i;
                    break;
                }
                '\t' => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let value = &rest[..end];
        if name.is_empty() || value.is_empty() {
            return None;
        }
        Some((name, value))
    }
}

/// Concatenates the surviving lines into `output`, one `\r\n` terminator per
/// line.
fn generate_output(output: &mut String, lines: &[SourceLine]) {
    output.clear();
    for line in lines {
        output.push_str(&line.text);
        output.push_str("\r\n");
    }
}
