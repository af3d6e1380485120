//! Nested-section logger for the compiler's phases.
//!
//! Compiled to no-ops unless built for tests or with the `tracing` feature.
//! The output file is chosen with the `JSIL_TRACING_SINK` environment
//! variable; without it, traces are dropped.

pub fn section(header: &str) -> Section {
    enabled::open(header)
}
pub type Section = enabled::Section;

#[cfg(all(not(test), not(feature = "tracing")))]
mod enabled {
    use std::fmt::Debug;

    pub fn open(_header: &str) -> Section {
        Section
    }
    pub struct Section;

    impl Section {
        pub fn log_value<T: Debug>(&self, _tag: &str, _value: &T) {}
        pub fn log(&self, _tag: &str, _value: &str) {}
    }
}

#[cfg(any(test, feature = "tracing"))]
mod enabled {
    use std::cell::Cell;
    use std::fmt::{Debug, Write as _};
    use std::fs::File;
    use std::io::Write as _;
    use std::sync::{Mutex, MutexGuard};

    thread_local! {
        static DEPTH: Cell<usize> = Cell::new(0);
    }

    lazy_static::lazy_static! {
        static ref SINK: Mutex<Sink> = Mutex::new(Sink::from_env());
    }

    /// Open a section; it closes when the returned guard is dropped.
    #[must_use]
    pub fn open(header: &str) -> Section {
        emit(&format!("<{}>", header));
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Section
    }

    pub struct Section;

    impl Section {
        pub fn log_value<T: Debug>(&self, tag: &str, value: &T) {
            emit(&format!("{}: {:#?}", tag, value));
        }

        pub fn log(&self, tag: &str, value: &str) {
            emit(&format!("{}: {}", tag, value));
        }
    }

    impl Drop for Section {
        fn drop(&mut self) {
            DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
            emit("</>");
        }
    }

    fn thread_tag() -> String {
        format!("{:?}| ", std::thread::current().id())
    }

    /// Every line is tagged with the thread, then indented by depth.
    fn emit(text: &str) {
        let tag = thread_tag();
        let indent = "    ".repeat(DEPTH.with(Cell::get));
        let mut out = String::with_capacity(text.len() + tag.len() + indent.len());
        for line in text.split('\n') {
            writeln!(out, "{}{}{}", tag, indent, line).unwrap();
        }
        sink().write(&out);
    }

    fn sink() -> MutexGuard<'static, Sink> {
        SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    enum Sink {
        Drop,
        File(File),
        #[cfg(test)]
        Memory(String),
    }

    impl Sink {
        fn from_env() -> Self {
            let Some(path) = std::env::var_os("JSIL_TRACING_SINK") else {
                return Sink::Drop;
            };
            match File::create(&path) {
                Ok(file) => Sink::File(file),
                Err(err) => {
                    eprintln!("jsil: tracing sink {:?}: {}", path, err);
                    Sink::Drop
                }
            }
        }

        fn write(&mut self, data: &str) {
            match self {
                Sink::Drop => {}
                // Flushed per write: traces are mostly read after a crash.
                Sink::File(file) => {
                    if file.write_all(data.as_bytes()).and_then(|()| file.flush()).is_err() {
                        *self = Sink::Drop;
                    }
                }
                #[cfg(test)]
                Sink::Memory(buf) => buf.push_str(data),
            }
        }
    }

    /// Route traces into memory and return what this thread wrote so far.
    #[cfg(test)]
    pub(super) fn capture_this_thread() -> String {
        let mut sink = sink();
        if !matches!(*sink, Sink::Memory(_)) {
            *sink = Sink::Memory(String::new());
        }
        let Sink::Memory(buf) = &*sink else {
            return String::new();
        };
        let tag = thread_tag();
        buf.lines()
            .filter_map(|line| line.strip_prefix(tag.as_str()))
            .map(|line| format!("{}\n", line))
            .collect()
    }
}
