//! Logical stacks.
//!
//! Each physical frame produced by an unwinder is expanded into one frame
//! per function inlined at its address, innermost first, followed by the
//! physical frame itself.

use std::sync::Arc;

use kestrel_target::{FileLine, Location, RawFrame, Symbol, SymbolResolver};

/// Frame of a logical stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    location: Location,
    inline: bool,
    physical_index: usize,
}

impl Frame {
    /// Returns the code address of the frame.
    pub fn address(&self) -> u64 {
        self.location.address
    }

    /// Returns the resolved location of the frame.
    ///
    /// For a frame calling an inlined function, the line is the call site
    /// of that function.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Returns whether this frame is synthesized for an inlined function.
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// Returns the index of the backing physical frame within
    /// [Stack::physical_frames].
    pub fn physical_index(&self) -> usize {
        self.physical_index
    }
}

/// Logical stack of a stopped thread, most recent frame first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stack {
    physical: Vec<RawFrame>,
    frames: Vec<Frame>,
}

impl Stack {
    /// Builds the stack from physical frames.
    pub async fn from_raw_frames(raw: Vec<RawFrame>, resolver: &impl SymbolResolver) -> Self {
        let mut stack = Self {
            physical: raw,
            frames: Vec::new(),
        };
        stack.expand(resolver).await;
        stack
    }

    /// Recomputes the logical frames from the stored physical frames, for
    /// instance once more symbols are available.
    pub async fn expand(&mut self, resolver: &impl SymbolResolver) {
        let mut frames = Vec::with_capacity(self.physical.len());

        for (index, raw) in self.physical.iter().enumerate() {
            let location = resolver.resolve(raw.address).await.unwrap_or_else(|e| {
                tracing::debug!(addr = format_args!("{:#x}", raw.address), error = %e, "resolve");
                Location::address_only(raw.address)
            });

            expand_physical_frame(location, index, &mut frames);
        }

        self.frames = frames;
    }

    /// Returns the number of logical frames.
    pub fn size(&self) -> usize {
        self.frames.len()
    }

    /// Returns whether the stack has no frame.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns a logical frame.
    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Iterates over the logical frames.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Returns the physical frames the stack was built from.
    pub fn physical_frames(&self) -> &[RawFrame] {
        &self.physical
    }

    /// Returns the physical frame backing a logical frame.
    pub fn physical_frame(&self, index: usize) -> Option<&RawFrame> {
        self.frames
            .get(index)
            .and_then(|frame| self.physical.get(frame.physical_index))
    }
}

fn expand_physical_frame(location: Location, physical_index: usize, frames: &mut Vec<Frame>) {
    let Location {
        address,
        symbol,
        file_line,
        symbolized,
    } = location;

    let mut line: Option<FileLine> = file_line;
    let mut function: Option<Arc<Symbol>> = symbol.as_ref().and_then(Symbol::containing_function);

    while let Some(inlined) = function.take_if(|f| f.is_inlined()) {
        frames.push(Frame {
            location: Location {
                address,
                symbol: Some(inlined.clone()),
                file_line: line.take(),
                symbolized,
            },
            inline: true,
            physical_index,
        });

        line = inlined.call_line.clone();
        function = inlined.parent.as_ref().and_then(Symbol::containing_function);
    }

    frames.push(Frame {
        location: Location {
            address,
            symbol: function,
            file_line: line,
            symbolized,
        },
        inline: false,
        physical_index,
    });
}
