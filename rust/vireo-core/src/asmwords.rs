//! Words and symbols of the intermediate assembly language.
//!
//! The contract between the compiler front end and the assembler: directive
//! keywords, operand marker characters, and the meta-information text format
//! attached to instructions for diagnostics.

/// First character of every directive line.
pub const DIRECTIVE_PREFIX: char = '#';

/// Declares a callee-local variable; locals get sequential LOCAL addresses.
pub const LOCAL_DIRECTIVE: &str = "#LOCAL";

/// Declares a script-global variable, resolved through the symbol table.
pub const GLOBAL_DIRECTIVE: &str = "#GLOBAL";

/// Declares a global function, resolved through the symbol table.
pub const FUNCTION_DIRECTIVE: &str = "#FUNCTION";

/// Names the next non-directive instruction's index.
pub const LABEL_DIRECTIVE: &str = "#LABEL";

/// Attaches a debug text constant to exactly the next instruction.
pub const META_DIRECTIVE: &str = "#META";

/// Marker of immediate-value operands, e.g. `~int:123`.
pub const IMMEDIATE_PREFIX: char = '~';

/// Marker of register operands, e.g. `R7`.
pub const REGISTER_PREFIX: char = 'R';

/// Marker of identifier operands, e.g. `_total`.
pub const IDENTIFIER_PREFIX: char = '_';

/// Marker of label operands, e.g. `&LOOP_BEGIN`.
pub const LABEL_PREFIX: char = '&';

/// Marker of placeholder operands (the NONE partition).
pub const PLACEHOLDER_PREFIX: char = '-';

/// Separator between the kind tag and the value of an immediate, and between
/// stacked type tags of an instruction.
pub const VALUE_SEPARATOR: char = ':';

/// Builds the immediate-operand spelling of a literal, e.g. `~int:42`.
pub fn immediate_of(kind_tag: &str, literal: &str) -> String {
    format!("{IMMEDIATE_PREFIX}{kind_tag}{VALUE_SEPARATOR}{literal}")
}

/// Builds the meta-information text embedded by the compiler front end.
pub fn meta_text(line: u32, file: &str) -> String {
    format!("line={line}, file={file}")
}

/// Extracts the source line number from meta-information text.
pub fn meta_line(meta: &str) -> Option<u32> {
    meta_item(meta, "line")?.parse().ok()
}

/// Extracts the source file name from meta-information text.
pub fn meta_file(meta: &str) -> Option<String> {
    meta_item(meta, "file").map(str::to_string)
}

fn meta_item<'a>(meta: &'a str, key: &str) -> Option<&'a str> {
    meta.split(',').find_map(|item| {
        let (k, v) = item.split_once('=')?;
        (k.trim() == key).then_some(v.trim())
    })
}
