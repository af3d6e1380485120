use std::rc::Rc;

use swc_common::{SourceMap, Span};

struct Item {
    span: Option<Span>,
    compiler_filename: String,
    compiler_lineno: u32,
    message: String,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(span) = self.span {
            write!(
                f,
                "{:?}: {} [raised at {}:{}]",
                span, self.message, self.compiler_filename, self.compiler_lineno
            )
        } else {
            write!(
                f,
                "{} [raised at {}:{}]",
                self.message, self.compiler_filename, self.compiler_lineno
            )
        }
    }
}

impl Item {
    fn message(&self, buf: &mut String, source_map: Option<&SourceMap>, indent_level: usize) {
        use std::fmt::Write;

        for _ in 0..indent_level {
            buf.push_str("  ");
        }

        let written = match (source_map, self.span) {
            (Some(source_map), Some(span)) if !span.is_dummy() => {
                let lo = source_map.lookup_char_pos(span.lo);
                let hi = source_map.lookup_char_pos(span.hi);
                write!(
                    buf,
                    "{}: {},{} - {},{}: {}",
                    lo.file.name,
                    lo.line,
                    lo.col_display,
                    hi.line,
                    hi.col_display,
                    self.message,
                )
            }

            (_, Some(span)) if !span.is_dummy() => {
                write!(
                    buf,
                    "byte {} - byte {}: {}",
                    span.lo.0, span.hi.0, self.message
                )
            }

            (_, _) => write!(buf, "{}", self.message),
        };
        written.unwrap();
    }
}

/// A fatal compilation error.
///
/// Carries the offending JS source span (when known) and a chain of context
/// items ("while compiling function f", ...).
pub struct Error {
    head: Item,
    chain: Vec<Item>,
    source_map: Option<Rc<SourceMap>>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())?;
        write!(
            f,
            "\n  [raised at {}:{}]",
            self.head.compiler_filename, self.head.compiler_lineno
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! error {
    ($($args:expr),+) => {{
        let message = format!($($args),*);
        $crate::common::Error::new(message, file!().to_owned(), line!())
    }}
}

/// Shorthand for the error raised when the emitter meets a node it has no
/// translation for.
#[macro_export]
macro_rules! unsupported_node {
    ($what:expr, $span:expr) => {{
        $crate::error!("unsupported: {}", $what).with_span($span)
    }};
}

impl From<std::io::Error> for Error {
    fn from(io_err: std::io::Error) -> Error {
        error!("{}", io_err)
    }
}

impl Error {
    pub(crate) fn new(message: String, src_filename: String, src_lineno: u32) -> Self {
        Error {
            head: Item {
                span: None,
                compiler_filename: src_filename,
                compiler_lineno: src_lineno,
                message,
            },
            chain: Vec::new(),
            source_map: None,
        }
    }

    pub(crate) fn with_span(mut self, span: Span) -> Self {
        if self.head.span.is_none() {
            self.head.span = Some(span);
        }
        self
    }

    pub(crate) fn with_source_map(mut self, source_map: Rc<SourceMap>) -> Self {
        self.source_map = Some(source_map);
        self
    }

    pub fn span(&self) -> Option<Span> {
        self.head.span
    }

    pub fn message(&self) -> String {
        self.message_ex(0)
    }

    pub fn message_ex(&self, indent_level: usize) -> String {
        let mut buf = String::new();
        let sm = self.source_map.as_ref().map(|rc| rc.as_ref());
        self.head.message(&mut buf, sm, indent_level);
        for ctx_item in self.chain.iter() {
            buf.push('\n');
            ctx_item.message(&mut buf, sm, indent_level + 1);
        }

        buf
    }

    pub fn messages(&self) -> impl '_ + Iterator<Item = String> {
        std::iter::once(&self.head)
            .chain(self.chain.iter())
            .map(|item| {
                let mut buf = String::new();
                item.message(&mut buf, self.source_map.as_deref(), 0);
                buf
            })
    }
}

pub trait Context<Err> {
    fn with_context(self, other: Err) -> Self;
}

impl Context<Error> for Error {
    fn with_context(mut self, mut other: Self) -> Self {
        self.chain.push(other.head);
        self.chain.extend(other.chain);
        if self.source_map.is_none() {
            self.source_map = other.source_map.take();
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> Context<Error> for Result<T> {
    fn with_context(self, other: Error) -> Self {
        self.map_err(|err| err.with_context(other))
    }
}
