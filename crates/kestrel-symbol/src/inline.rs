use kestrel_target::{FileLine, Location, Symbol};

/// Frame of debug information, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct InlineFrame {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl InlineFrame {
    fn file_line(&self) -> Option<FileLine> {
        self.line.map(|line| FileLine::new(self.file.clone(), line))
    }
}

/// Builds a location from the debug frames of an address.
///
/// The outermost frame is the real function, each inner frame is inlined
/// into the one after it, called from that frame's line.
pub(crate) fn build_location(
    address: u64,
    symbol_name: Option<String>,
    frames: Vec<InlineFrame>,
) -> Location {
    let file_line = frames.first().and_then(InlineFrame::file_line);

    let mut symbol = None;
    let mut outer: Option<&InlineFrame> = None;

    for frame in frames.iter().rev() {
        let name = frame
            .function
            .clone()
            .unwrap_or_else(|| String::from("<unknown>"));

        symbol = Some(match (symbol.take(), outer) {
            (Some(parent), Some(outer)) => {
                let call_line = outer.file_line().unwrap_or_default();
                Symbol::inlined(name, call_line, parent)
            }
            _ => Symbol::function(name),
        });

        outer = Some(frame);
    }

    // no debug information, only the symbol table
    if symbol.is_none() {
        symbol = symbol_name.map(Symbol::function);
    }

    Location {
        address,
        symbol,
        file_line,
        symbolized: true,
    }
}
