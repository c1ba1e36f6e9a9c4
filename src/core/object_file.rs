//! ELF relocatable object emission.
//!
//! The object holds one `.text` section with the method's code and one global
//! function symbol covering all of it. Code is expected to be assembled at
//! base 0; branches to absolute addresses are emitted as-is and carry no
//! relocations.

use crate::codegen::MachineCode;
use crate::core::error::{CodeGenError, CodeGenResult};
use crate::cpu::Isa;
use log::debug;
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

fn architecture(isa: Isa) -> (Architecture, u64) {
    match isa {
        Isa::X86_64 => (Architecture::X86_64, 16),
        Isa::Aarch64 => (Architecture::Aarch64, 4),
    }
}

/// Writes `code` into an ELF object defining `symbol`.
pub fn write_object(code: &MachineCode, symbol: &str) -> CodeGenResult<Vec<u8>> {
    let (arch, align) = architecture(code.isa);
    let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &code.bytes, align);
    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: code.bytes.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let bytes = obj
        .write()
        .map_err(|e| CodeGenError::Object(e.to_string()))?;
    debug!("{} object: {} bytes, symbol {}", code.isa, bytes.len(), symbol);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    #[test]
    fn object_contains_text_and_symbol() {
        let code = MachineCode {
            isa: Isa::Aarch64,
            base: 0,
            bytes: 0xD65F_03C0u32.to_le_bytes().to_vec(),
            direct_branches: 0,
            indirect_branches: 0,
            scalarized_ops: 0,
        };
        let bytes = write_object(&code, "leaf").unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::Aarch64);
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &code.bytes[..]);
        let sym = file.symbol_by_name("leaf").unwrap();
        assert_eq!(sym.size(), 4);
        assert!(sym.is_global());
    }
}
