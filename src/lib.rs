#![forbid(unsafe_code)]

pub mod error;
pub mod eval;
pub mod preproc;
pub mod scan;
pub mod substitute;

pub use error::{PreshadeError, PreshadeResult};
pub use eval::{EvalError, EvalErrorKind, EvalFn, ExpressionEvaluator, FuncRegistry};
pub use preproc::{FileCallback, FsFileCallback, Preprocessor, SourceLine};
pub use scan::strip_comments;
pub use substitute::MacroTable;
