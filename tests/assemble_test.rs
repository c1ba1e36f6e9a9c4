//! Assembly tests that run on any host.
//!
//! Methods are assembled for a fixed base address without being loaded, and
//! the output is inspected: x86-64 code is decoded with iced-x86, AArch64 code
//! is checked word by word. The focus is the choice between direct and
//! indirect branch and call sequences.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction};
use iced_x86::Mnemonic;
use treejit::codegen::{assemble, CompileOptions, MachineCode};
use treejit::core::CodeGenError;
use treejit::cpu::{Cpu, Isa};
use treejit::{parse, Method};

const BR_X16: u32 = 0xD61F_0200;
const BLR_X16: u32 = 0xD63F_0200;

fn decode(code: &MachineCode) -> Vec<Instruction> {
    Decoder::with_ip(64, &code.bytes, code.base, DecoderOptions::NONE)
        .iter()
        .collect()
}

fn words(code: &MachineCode) -> Vec<u32> {
    code.bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Target of a `B`/`BL` word at `pc`.
fn branch26_target(word: u32, pc: u64) -> u64 {
    let imm = ((word & 0x03FF_FFFF) << 6) as i32 >> 6;
    pc.wrapping_add_signed(imm as i64 * 4)
}

/// Value materialized by the MOVZ + 3 MOVK sequence ending at `words[end - 1]`.
fn mov_abs_value(words: &[u32], end: usize) -> u64 {
    words[end - 4..end].iter().fold(0u64, |acc, w| {
        let hw = (w >> 21) & 3;
        let imm = ((w >> 5) & 0xFFFF) as u64;
        acc | (imm << (16 * hw))
    })
}

fn call_method(target: u64) -> Method {
    parse(&format!(
        "(method name=caller return=NoType args=[] (block (call address={target:#x}) (return)))"
    ))
    .unwrap()
}

const BRANCHY: &str = "(method name=classify return=Int32 args=[Int32] \
     (block (ificmpgt target=big (iload parm=0) (iconst 10)) (goto target=small)) \
     (block name=small (ireturn (iconst 0))) \
     (block name=big (ireturn (iconst 1))))";

#[test]
fn test_x86_call_in_range_is_direct() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::X86_64);
    let code = assemble(&call_method(0x2000), &cpu, 0x1000, &CompileOptions::default()).unwrap();
    let instrs = decode(&code);
    let call = instrs
        .iter()
        .find(|i| i.code() == Code::Call_rel32_64)
        .expect("direct call");
    assert_eq!(call.near_branch_target(), 0x2000);
    assert!(!instrs.iter().any(|i| i.code() == Code::Call_rm64));
    assert_eq!((code.direct_branches, code.indirect_branches), (1, 0));
}

#[test]
fn test_x86_call_out_of_range_is_indirect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::X86_64);
    let code = assemble(&call_method(0x7fff_0000_0000), &cpu, 0x1000, &CompileOptions::default()).unwrap();
    let instrs = decode(&code);
    let at = instrs
        .iter()
        .position(|i| i.code() == Code::Call_rm64)
        .expect("indirect call");
    assert_eq!(instrs[at - 1].code(), Code::Mov_r64_imm64);
    assert_eq!(instrs[at - 1].immediate64(), 0x7fff_0000_0000);
    assert!(!instrs.iter().any(|i| i.code() == Code::Call_rel32_64));
    assert_eq!((code.direct_branches, code.indirect_branches), (0, 1));
}

#[test]
fn test_aarch64_call_in_range_is_direct() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::Aarch64);
    let code = assemble(&call_method(0x2000), &cpu, 0x1000, &CompileOptions::default()).unwrap();
    let w = words(&code);
    let at = w
        .iter()
        .position(|w| w & 0xFC00_0000 == 0x9400_0000)
        .expect("bl");
    assert_eq!(branch26_target(w[at], code.base + 4 * at as u64), 0x2000);
    assert!(!w.contains(&BLR_X16));
}

#[test]
fn test_aarch64_call_out_of_range_is_indirect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::Aarch64);
    let code = assemble(&call_method(0x7fff_0000_0000), &cpu, 0x1000, &CompileOptions::default()).unwrap();
    let w = words(&code);
    let at = w.iter().position(|w| *w == BLR_X16).expect("blr x16");
    assert_eq!(mov_abs_value(&w, at), 0x7fff_0000_0000);
    assert!(!w.iter().any(|w| w & 0xFC00_0000 == 0x9400_0000));
}

#[test]
fn test_aarch64_call_at_forward_limit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::Aarch64);
    let options = CompileOptions::default();
    let base = 0x1000_0000;
    let probe = assemble(&call_method(base + 0x100), &cpu, base, &options).unwrap();
    let at = words(&probe)
        .iter()
        .position(|w| w & 0xFC00_0000 == 0x9400_0000)
        .expect("bl");
    let pc = base + 4 * at as u64;
    let limit = cpu.max_unconditional_branch_immediate_forward_offset();

    let edge = assemble(&call_method(pc + limit), &cpu, base, &options).unwrap();
    let w = words(&edge);
    assert_eq!(branch26_target(w[at], pc), pc + limit);
    assert_eq!(edge.indirect_branches, 0);

    let past = assemble(&call_method(pc + limit + 4), &cpu, base, &options).unwrap();
    assert!(words(&past).contains(&BLR_X16));
    assert_eq!(past.indirect_branches, 1);
}

#[test]
fn test_aarch64_forward_gotos_follow_the_code_limit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::Aarch64);
    let method = parse(BRANCHY).unwrap();

    let near = assemble(&method, &cpu, 0x10000, &CompileOptions::default()).unwrap();
    assert!(!words(&near).contains(&BR_X16));
    assert_eq!(near.indirect_branches, 0);
    assert!(near.direct_branches >= 2);

    // a region larger than the B range: unbound labels may land out of reach
    let options = CompileOptions::default().with_max_code_size(256 << 20);
    let far = assemble(&method, &cpu, 0x10000, &options).unwrap();
    let w = words(&far);
    assert_eq!(far.direct_branches, 0);
    assert!(far.indirect_branches >= 2);
    for (i, _) in w.iter().enumerate().filter(|(_, w)| **w == BR_X16) {
        let target = mov_abs_value(&w, i);
        assert!(target >= far.base && target < far.base + far.bytes.len() as u64);
        assert_eq!(target % 4, 0);
    }
}

#[test]
fn test_x86_gotos_stay_direct_for_large_regions() {
    let cpu = Cpu::new(Isa::X86_64);
    let method = parse(BRANCHY).unwrap();
    let options = CompileOptions::default().with_max_code_size(256 << 20);
    let code = assemble(&method, &cpu, 0x10000, &options).unwrap();
    assert_eq!(code.indirect_branches, 0);

    let instrs = decode(&code);
    let end = code.base + code.bytes.len() as u64;
    for jump in instrs.iter().filter(|i| i.code() == Code::Jmp_rel32_64) {
        let target = jump.near_branch_target();
        assert!(target >= code.base && target < end, "{target:#x}");
    }
}

#[test]
fn test_backward_goto_uses_exact_address() {
    let _ = env_logger::builder().is_test(true).try_init();

    let method = parse(
        "(method name=spin return=NoType args=[Address] \
           (block name=top \
             (ificmpeq target=out (iloadi (aload parm=0)) (iconst 0)) \
             (istorei (aload parm=0) (isub (iloadi (aload parm=0)) (iconst 1))) \
             (goto target=top)) \
           (block name=out (return)))",
    )
    .unwrap();
    // only the forward compare-branch is pessimistic
    let options = CompileOptions::default().with_max_code_size(256 << 20);
    let code = assemble(&method, &Cpu::new(Isa::Aarch64), 0x10000, &options).unwrap();
    let w = words(&code);
    let back = w
        .iter()
        .enumerate()
        .find(|(i, w)| {
            **w & 0xFC00_0000 == 0x1400_0000 && branch26_target(**w, code.base + 4 * *i as u64) < code.base + 4 * *i as u64
        })
        .expect("backward b");
    assert!(branch26_target(*back.1, code.base + 4 * back.0 as u64) >= code.base);
    assert_eq!(code.direct_branches, 1);
    assert_eq!(code.indirect_branches, 1);
}

#[test]
fn test_assembly_depends_on_base() {
    let method = call_method(0x5000_0000);
    let cpu = Cpu::new(Isa::X86_64);
    let options = CompileOptions::default();
    let low = assemble(&method, &cpu, 0x1000, &options).unwrap();
    let high = assemble(&method, &cpu, 0x7000_0000_0000, &options).unwrap();
    assert_eq!(low.indirect_branches, 0);
    assert_eq!(high.indirect_branches, 1);
    assert_ne!(low.bytes, high.bytes);
}

const NEG_W10: u32 = 0x4B0A_03EA;
const LSLV_MASK: u32 = 0x7FE0_FC00;
const LSLV: u32 = 0x1AC0_2000;

fn rotate_method(prefix: char, ty: &str) -> Method {
    parse(&format!(
        "(method return={ty} args=[{ty},Int32] \
         (block ({prefix}return ({prefix}rol ({prefix}load parm=0) (iload parm=1)))))"
    ))
    .unwrap()
}

#[test]
fn test_aarch64_rotate_left_uses_negated_rotate_right() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = Cpu::new(Isa::Aarch64);
    assert!(!cpu.supports_32bit_rotate(true));
    assert!(!cpu.supports_64bit_rotate(true));

    // ror w9, w9, w10 and ror x9, x9, x10
    for (prefix, ty, rorv) in [('i', "Int32", 0x1ACA_2D29u32), ('l', "Int64", 0x9ACA_2D29)] {
        let code = assemble(&rotate_method(prefix, ty), &cpu, 0x10000, &CompileOptions::default()).unwrap();
        let w = words(&code);
        assert!(
            w.windows(2).any(|pair| pair == [NEG_W10, rorv]),
            "{prefix}rol: {w:08x?}"
        );
        assert!(!w.iter().any(|word| word & LSLV_MASK == LSLV), "{prefix}rol shifts left");
    }
}

#[test]
fn test_x86_rotate_left_is_native() {
    let cpu = Cpu::new(Isa::X86_64);
    for (prefix, ty) in [('i', "Int32"), ('l', "Int64")] {
        let code = assemble(&rotate_method(prefix, ty), &cpu, 0x10000, &CompileOptions::default()).unwrap();
        let mnemonics: Vec<Mnemonic> = decode(&code).iter().map(|i| i.mnemonic()).collect();
        assert!(mnemonics.contains(&Mnemonic::Rol));
        assert!(!mnemonics.contains(&Mnemonic::Ror));
        assert!(!mnemonics.contains(&Mnemonic::Neg));
    }
}

#[test]
fn test_region_past_the_address_space_is_refused() {
    let method = parse(BRANCHY).unwrap();
    let options = CompileOptions::default();
    for isa in [Isa::X86_64, Isa::Aarch64] {
        let err = assemble(&method, &Cpu::new(isa), u64::MAX - 0x100, &options).unwrap_err();
        assert!(matches!(err, CodeGenError::AddressSpace { base, .. } if base == u64::MAX - 0x100), "{err}");

        // the last region that still fits
        let base = u64::MAX - options.max_code_size as u64;
        let code = assemble(&method, &Cpu::new(isa), base, &options).unwrap();
        assert_eq!(code.base, base);
    }
}
