use std::future::Future;
use std::sync::Arc;

/// Source file and line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileLine {
    /// Source file, when known.
    pub file: Option<String>,

    /// Line number.
    pub line: u32,
}

impl FileLine {
    /// Creates a new file/line pair.
    pub fn new(file: impl Into<Option<String>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Kind of a resolved symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// Real (out-of-line) function.
    Function,

    /// Function inlined into its lexical parent.
    InlinedFunction,

    /// Lexical block within a function.
    Block,
}

/// Resolved symbol, with its lexical parent chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// Name of the symbol.
    pub name: String,

    /// Kind of the symbol.
    pub kind: SymbolKind,

    /// For inlined functions, the location of the call site within the
    /// lexical parent.
    pub call_line: Option<FileLine>,

    /// Lexical parent.
    pub parent: Option<Arc<Symbol>>,
}

impl Symbol {
    /// Creates a real function symbol.
    pub fn function(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: SymbolKind::Function,
            call_line: None,
            parent: None,
        })
    }

    /// Creates a symbol for a function inlined into `parent`, called from
    /// `call_line`.
    pub fn inlined(name: impl Into<String>, call_line: FileLine, parent: Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: SymbolKind::InlinedFunction,
            call_line: Some(call_line),
            parent: Some(parent),
        })
    }

    /// Returns whether this symbol is an inlined function.
    pub fn is_inlined(&self) -> bool {
        self.kind == SymbolKind::InlinedFunction
    }

    /// Walks the lexical parents up to the nearest function (inlined or
    /// not), skipping blocks.
    pub fn containing_function(self: &Arc<Self>) -> Option<Arc<Self>> {
        let mut cur = Some(self.clone());

        while let Some(sym) = cur {
            if sym.kind != SymbolKind::Block {
                return Some(sym);
            }
            cur = sym.parent.clone();
        }

        None
    }
}

/// Result of an address resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// Resolved address.
    pub address: u64,

    /// Innermost symbol covering the address.
    pub symbol: Option<Arc<Symbol>>,

    /// Source location executing at the address.
    pub file_line: Option<FileLine>,

    /// Whether symbolization was performed, as opposed to an address-only
    /// location.
    pub symbolized: bool,
}

impl Location {
    /// Creates an address-only location.
    pub fn address_only(address: u64) -> Self {
        Self {
            address,
            symbol: None,
            file_line: None,
            symbolized: false,
        }
    }
}

/// Symbol resolution collaborator.
pub trait SymbolResolver {
    /// Resolves an address of the debugged process.
    fn resolve(&self, address: u64) -> impl Future<Output = crate::Result<Location>>;
}
