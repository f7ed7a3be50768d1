use std::collections::BTreeMap;

use preshade::{FileCallback, Preprocessor};

/// In-memory file set standing in for the filesystem.
struct MemFiles {
    files: BTreeMap<&'static str, &'static str>,
    open: Option<&'static [u8]>,
    cursor: usize,
}

impl MemFiles {
    fn new(files: &[(&'static str, &'static str)]) -> Self {
        Self {
            files: files.iter().copied().collect(),
            open: None,
            cursor: 0,
        }
    }
}

impl FileCallback for MemFiles {
    fn open(&mut self, name: &str) -> bool {
        match self.files.get(name) {
            Some(text) => {
                self.open = Some(text.as_bytes());
                self.cursor = 0;
                true
            }
            None => false,
        }
    }

    fn close(&mut self) {
        self.open = None;
        self.cursor = 0;
    }

    fn size(&self) -> u32 {
        self.open.map_or(0, |b| b.len() as u32)
    }

    fn read(&mut self, max_len: u32, dst: &mut [u8]) -> u32 {
        let Some(bytes) = self.open else { return 0 };
        let n = (max_len as usize)
            .min(dst.len())
            .min(bytes.len() - self.cursor);
        dst[..n].copy_from_slice(&bytes[self.cursor..self.cursor + n]);
        self.cursor += n;
        n as u32
    }
}

fn preprocessor(files: &[(&'static str, &'static str)]) -> Preprocessor {
    Preprocessor::with_file_callback(Box::new(MemFiles::new(files)))
}

/// Routes tracing output through the test harness capture.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

#[test]
fn include_flattens_inline() {
    let mut pp = preprocessor(&[
        ("main.fsh", "top\n#include \"common.h\"\nbottom\n"),
        ("common.h", "shared\n"),
    ]);
    let mut out = String::new();
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "top\r\nshared\r\nbottom\r\n");
}

#[test]
fn includes_nest() {
    let mut pp = preprocessor(&[
        ("main.fsh", "#include \"a.h\"\nmain\n"),
        ("a.h", "a-begin\n#include \"b.h\"\na-end\n"),
        ("b.h", "b\n"),
    ]);
    let mut out = String::new();
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "a-begin\r\nb\r\na-end\r\nmain\r\n");
}

#[test]
fn included_defines_are_visible_afterwards() {
    let mut pp = preprocessor(&[
        ("main.fsh", "#include \"defs.h\"\n#if QUALITY > 1\nhigh\n#endif\nRADIUS\n"),
        ("defs.h", "#define QUALITY 2\n#define RADIUS 4\n"),
    ]);
    let mut out = String::new();
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "high\r\n4\r\n");
}

#[test]
fn include_in_skipped_region_is_not_opened() {
    // No "missing.h" in the set; if the include ran, processing would fail.
    let mut pp = preprocessor(&[(
        "main.fsh",
        "#if 0\n#include \"missing.h\"\n#endif\nok\n",
    )]);
    let mut out = String::new();
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "ok\r\n");
}

#[test]
fn missing_include_is_an_io_error() {
    init_tracing();
    let mut pp = preprocessor(&[("main.fsh", "#include \"nope.h\"\n")]);
    let mut out = String::new();
    assert!(!pp.process_file("main.fsh", &mut out));
    assert!(out.is_empty());
    let msg = pp.last_error().map(ToString::to_string).unwrap_or_default();
    assert!(msg.contains("io error"), "{msg}");
    assert!(msg.contains("nope.h"), "{msg}");
}

#[test]
fn include_without_quotes_is_a_directive_error() {
    let mut pp = preprocessor(&[("main.fsh", "#include <common.h>\n")]);
    let mut out = String::new();
    assert!(!pp.process_file("main.fsh", &mut out));
    let msg = pp.last_error().map(ToString::to_string).unwrap_or_default();
    assert!(msg.contains("double quotes"), "{msg}");
}

#[test]
fn errors_in_included_files_name_the_include() {
    init_tracing();
    let mut pp = preprocessor(&[
        ("main.fsh", "fine\n#include \"broken.h\"\n"),
        ("broken.h", "ok\n#if NEVER_DEFINED\n#endif\n"),
    ]);
    let mut out = String::new();
    assert!(!pp.process_file("main.fsh", &mut out));
    let msg = pp.last_error().map(ToString::to_string).unwrap_or_default();
    assert!(msg.contains("broken.h:2:"), "{msg}");
    assert!(msg.contains("unknown symbol"), "{msg}");
}

#[test]
fn seeded_defines_drive_conditionals() {
    let mut pp = preprocessor(&[(
        "main.fsh",
        "\
#if LIGHTING && defined(SHADOWS)
lit-shadowed
#elif LIGHTING
lit
#else
flat
#endif
",
    )]);

    assert!(pp.add_define("LIGHTING", "1"));

    let mut out = String::new();
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "lit\r\n");

    assert!(pp.add_define("SHADOWS", "1"));
    assert!(pp.process_file("main.fsh", &mut out));
    assert_eq!(out, "lit-shadowed\r\n");

    pp.clear();
    assert!(!pp.process_file("main.fsh", &mut out));
    let msg = pp.last_error().map(ToString::to_string).unwrap_or_default();
    assert!(msg.contains("unknown symbol"), "{msg}");
}

#[test]
fn shader_fixture_end_to_end() {
    let src = include_str!("data/lighting.fsh");
    let mut pp = Preprocessor::new();
    assert!(pp.add_define("LIGHTING_MODE", "2"));
    assert!(pp.add_define("MAX_LIGHTS", "4"));

    let mut out = String::new();
    assert!(pp.process(src, &mut out), "{:?}", pp.last_error());

    assert!(out.contains("for (int i = 0; i < 4; ++i)"), "{out}");
    assert!(out.contains("applySpecular"), "{out}");
    assert!(!out.contains("applyFlat"), "{out}");
    assert!(!out.contains("/*"), "{out}");
    assert!(!out.contains("LIGHTING_MODE"), "{out}");
    for line in out.split_inclusive("\r\n") {
        assert!(line.ends_with("\r\n"), "unterminated line: {line:?}");
    }
}
