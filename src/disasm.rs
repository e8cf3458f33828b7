// Z80 disassembler used by the debugger and the remote stub. The main
// opcode page is table-driven; CB, ED and the IX/IY pages are decoded from
// their regular bit patterns, with the DDCB/FDCB displacement handled
// specially. Operand markers in the templates: `#` immediate byte, `##`
// immediate word, `%` relative target. When a symbol matches an absolute
// or relative target, its label replaces the number.

/// (template, size in bytes) for the unprefixed page.
const MAIN_OPCODES: [(&str, u8); 256] = [
    ("nop", 1),
    ("ld     bc, ##", 3),
    ("ld     (bc), a", 1),
    ("inc    bc", 1),
    ("inc    b", 1),
    ("dec    b", 1),
    ("ld     b, #", 2),
    ("rlca", 1),
    ("ex     af, af'", 1),
    ("add    hl, bc", 1),
    ("ld     a, (bc)", 1),
    ("dec    bc", 1),
    ("inc    c", 1),
    ("dec    c", 1),
    ("ld     c, #", 2),
    ("rrca", 1),
    ("djnz   %", 2),
    ("ld     de, ##", 3),
    ("ld     (de), a", 1),
    ("inc    de", 1),
    ("inc    d", 1),
    ("dec    d", 1),
    ("ld     d, #", 2),
    ("rla", 1),
    ("jr     %", 2),
    ("add    hl, de", 1),
    ("ld     a, (de)", 1),
    ("dec    de", 1),
    ("inc    e", 1),
    ("dec    e", 1),
    ("ld     e, #", 2),
    ("rra", 1),
    ("jr     nz, %", 2),
    ("ld     hl, ##", 3),
    ("ld     (##), hl", 3),
    ("inc    hl", 1),
    ("inc    h", 1),
    ("dec    h", 1),
    ("ld     h, #", 2),
    ("daa", 1),
    ("jr     z, %", 2),
    ("add    hl, hl", 1),
    ("ld     hl, (##)", 3),
    ("dec    hl", 1),
    ("inc    l", 1),
    ("dec    l", 1),
    ("ld     l, #", 2),
    ("cpl", 1),
    ("jr     nc, %", 2),
    ("ld     sp, ##", 3),
    ("ld     (##), a", 3),
    ("inc    sp", 1),
    ("inc    (hl)", 1),
    ("dec    (hl)", 1),
    ("ld     (hl), #", 2),
    ("scf", 1),
    ("jr     c, %", 2),
    ("add    hl, sp", 1),
    ("ld     a, (##)", 3),
    ("dec    sp", 1),
    ("inc    a", 1),
    ("dec    a", 1),
    ("ld     a, #", 2),
    ("ccf", 1),
    ("ld     b, b", 1),
    ("ld     b, c", 1),
    ("ld     b, d", 1),
    ("ld     b, e", 1),
    ("ld     b, h", 1),
    ("ld     b, l", 1),
    ("ld     b, (hl)", 1),
    ("ld     b, a", 1),
    ("ld     c, b", 1),
    ("ld     c, c", 1),
    ("ld     c, d", 1),
    ("ld     c, e", 1),
    ("ld     c, h", 1),
    ("ld     c, l", 1),
    ("ld     c, (hl)", 1),
    ("ld     c, a", 1),
    ("ld     d, b", 1),
    ("ld     d, c", 1),
    ("ld     d, d", 1),
    ("ld     d, e", 1),
    ("ld     d, h", 1),
    ("ld     d, l", 1),
    ("ld     d, (hl)", 1),
    ("ld     d, a", 1),
    ("ld     e, b", 1),
    ("ld     e, c", 1),
    ("ld     e, d", 1),
    ("ld     e, e", 1),
    ("ld     e, h", 1),
    ("ld     e, l", 1),
    ("ld     e, (hl)", 1),
    ("ld     e, a", 1),
    ("ld     h, b", 1),
    ("ld     h, c", 1),
    ("ld     h, d", 1),
    ("ld     h, e", 1),
    ("ld     h, h", 1),
    ("ld     h, l", 1),
    ("ld     h, (hl)", 1),
    ("ld     h, a", 1),
    ("ld     l, b", 1),
    ("ld     l, c", 1),
    ("ld     l, d", 1),
    ("ld     l, e", 1),
    ("ld     l, h", 1),
    ("ld     l, l", 1),
    ("ld     l, (hl)", 1),
    ("ld     l, a", 1),
    ("ld     (hl), b", 1),
    ("ld     (hl), c", 1),
    ("ld     (hl), d", 1),
    ("ld     (hl), e", 1),
    ("ld     (hl), h", 1),
    ("ld     (hl), l", 1),
    ("halt", 1),
    ("ld     (hl), a", 1),
    ("ld     a, b", 1),
    ("ld     a, c", 1),
    ("ld     a, d", 1),
    ("ld     a, e", 1),
    ("ld     a, h", 1),
    ("ld     a, l", 1),
    ("ld     a, (hl)", 1),
    ("ld     a, a", 1),
    ("add    a, b", 1),
    ("add    a, c", 1),
    ("add    a, d", 1),
    ("add    a, e", 1),
    ("add    a, h", 1),
    ("add    a, l", 1),
    ("add    a, (hl)", 1),
    ("add    a, a", 1),
    ("adc    a, b", 1),
    ("adc    a, c", 1),
    ("adc    a, d", 1),
    ("adc    a, e", 1),
    ("adc    a, h", 1),
    ("adc    a, l", 1),
    ("adc    a, (hl)", 1),
    ("adc    a, a", 1),
    ("sub    b", 1),
    ("sub    c", 1),
    ("sub    d", 1),
    ("sub    e", 1),
    ("sub    h", 1),
    ("sub    l", 1),
    ("sub    (hl)", 1),
    ("sub    a", 1),
    ("sbc    a, b", 1),
    ("sbc    a, c", 1),
    ("sbc    a, d", 1),
    ("sbc    a, e", 1),
    ("sbc    a, h", 1),
    ("sbc    a, l", 1),
    ("sbc    a, (hl)", 1),
    ("sbc    a, a", 1),
    ("and    b", 1),
    ("and    c", 1),
    ("and    d", 1),
    ("and    e", 1),
    ("and    h", 1),
    ("and    l", 1),
    ("and    (hl)", 1),
    ("and    a", 1),
    ("xor    b", 1),
    ("xor    c", 1),
    ("xor    d", 1),
    ("xor    e", 1),
    ("xor    h", 1),
    ("xor    l", 1),
    ("xor    (hl)", 1),
    ("xor    a", 1),
    ("or     b", 1),
    ("or     c", 1),
    ("or     d", 1),
    ("or     e", 1),
    ("or     h", 1),
    ("or     l", 1),
    ("or     (hl)", 1),
    ("or     a", 1),
    ("cp     b", 1),
    ("cp     c", 1),
    ("cp     d", 1),
    ("cp     e", 1),
    ("cp     h", 1),
    ("cp     l", 1),
    ("cp     (hl)", 1),
    ("cp     a", 1),
    ("ret    nz", 1),
    ("pop    bc", 1),
    ("jp     nz, ##", 3),
    ("jp     ##", 3),
    ("call   nz, ##", 3),
    ("push   bc", 1),
    ("add    a, #", 2),
    ("rst    00h", 1),
    ("ret    z", 1),
    ("ret", 1),
    ("jp     z, ##", 3),
    ("ill", 1), // CB prefix, decoded separately
    ("call   z, ##", 3),
    ("call   ##", 3),
    ("adc    a, #", 2),
    ("rst    08h", 1),
    ("ret    nc", 1),
    ("pop    de", 1),
    ("jp     nc, ##", 3),
    ("out    (#), a", 2),
    ("call   nc, ##", 3),
    ("push   de", 1),
    ("sub    #", 2),
    ("rst    10h", 1),
    ("ret    c", 1),
    ("exx", 1),
    ("jp     c, ##", 3),
    ("in     a, (#)", 2),
    ("call   c, ##", 3),
    ("ill", 1), // DD prefix
    ("sbc    a, #", 2),
    ("rst    18h", 1),
    ("ret    po", 1),
    ("pop    hl", 1),
    ("jp     po, ##", 3),
    ("ex     (sp), hl", 1),
    ("call   po, ##", 3),
    ("push   hl", 1),
    ("and    #", 2),
    ("rst    20h", 1),
    ("ret    pe", 1),
    ("jp     (hl)", 1),
    ("jp     pe, ##", 3),
    ("ex     de, hl", 1),
    ("call   pe, ##", 3),
    ("ill", 1), // ED prefix
    ("xor    #", 2),
    ("rst    28h", 1),
    ("ret    p", 1),
    ("pop    af", 1),
    ("jp     p, ##", 3),
    ("di", 1),
    ("call   p, ##", 3),
    ("push   af", 1),
    ("or     #", 2),
    ("rst    30h", 1),
    ("ret    m", 1),
    ("ld     sp, hl", 1),
    ("jp     m, ##", 3),
    ("ei", 1),
    ("call   m, ##", 3),
    ("ill", 1), // FD prefix
    ("cp     #", 2),
    ("rst    38h", 1),
];

const REGS8: [&str; 8] = ["b", "c", "d", "e", "h", "l", "(hl)", "a"];
const ROT_OPS: [&str; 8] = ["rlc", "rrc", "rl", "rr", "sla", "sra", "sll", "srl"];
const REGS16: [&str; 4] = ["bc", "de", "hl", "sp"];

/// Disassemble up to four bytes at `addr`. `lookup` resolves a target
/// address to a label. Returns the text and the instruction size.
pub fn disassemble(
    opcodes: &[u8; 4],
    addr: u16,
    lookup: impl Fn(u16) -> Option<String>,
) -> (String, usize) {
    match opcodes[0] {
        0xcb => (decode_cb(opcodes[1], None), 2),
        0xed => decode_ed(opcodes, &lookup),
        0xdd => decode_index(opcodes, 'x'),
        0xfd => decode_index(opcodes, 'y'),
        _ => decode_main(opcodes, addr, &lookup),
    }
}

/// Size in bytes of the instruction starting at `opcodes[0]`; used by
/// step-over to plant its one-shot breakpoint.
pub fn instruction_size(opcodes: &[u8; 4]) -> usize {
    disassemble(opcodes, 0, |_| None).1
}

fn decode_main(opcodes: &[u8; 4], addr: u16, lookup: &impl Fn(u16) -> Option<String>) -> (String, usize) {
    let (template, size) = MAIN_OPCODES[opcodes[0] as usize];
    let size = size as usize;

    let text = if template.contains("##") {
        let word = opcodes[1] as u16 | (opcodes[2] as u16) << 8;
        let operand = lookup(word).unwrap_or_else(|| format!("0x{:04x}", word));
        template.replace("##", &operand)
    } else if template.contains('%') {
        // Relative target from the signed displacement
        let target = addr.wrapping_add(2).wrapping_add(opcodes[1] as i8 as u16);
        let operand = lookup(target).unwrap_or_else(|| format!("0x{:04x}", target));
        template.replace('%', &operand)
    } else if template.contains('#') {
        template.replace('#', &format!("0x{:x}", opcodes[1]))
    } else {
        template.to_string()
    };

    (text, size)
}

/// CB page: rotations and the bit/res/set grids. With `index` set, the
/// operand is the displaced index register of a DDCB/FDCB sequence.
fn decode_cb(op: u8, index: Option<(char, u8)>) -> String {
    let operand = match index {
        Some((reg, disp)) => format!("(i{}{:+})", reg, disp as i8),
        None => REGS8[(op & 0x7) as usize].to_string(),
    };
    match op >> 6 {
        0 => format!("{:<6} {}", ROT_OPS[((op >> 3) & 0x7) as usize], operand),
        1 => format!("bit    {}, {}", (op >> 3) & 0x7, operand),
        2 => format!("res    {}, {}", (op >> 3) & 0x7, operand),
        _ => format!("set    {}, {}", (op >> 3) & 0x7, operand),
    }
}

fn decode_ed(opcodes: &[u8; 4], lookup: &impl Fn(u16) -> Option<String>) -> (String, usize) {
    let op = opcodes[1];
    let pair = REGS16[((op >> 4) & 0x3) as usize];

    let fixed = match op {
        0x44 | 0x4c | 0x54 | 0x5c | 0x64 | 0x6c | 0x74 | 0x7c => "neg",
        0x45 => "retn",
        0x4d => "reti",
        0x46 | 0x66 => "im     0",
        0x56 | 0x76 => "im     1",
        0x5e | 0x7e => "im     2",
        0x47 => "ld     i, a",
        0x4f => "ld     r, a",
        0x57 => "ld     a, i",
        0x5f => "ld     a, r",
        0x67 => "rrd",
        0x6f => "rld",
        0xa0 => "ldi",
        0xa1 => "cpi",
        0xa2 => "ini",
        0xa3 => "outi",
        0xa8 => "ldd",
        0xa9 => "cpd",
        0xaa => "ind",
        0xab => "outd",
        0xb0 => "ldir",
        0xb1 => "cpir",
        0xb2 => "inir",
        0xb3 => "otir",
        0xb8 => "lddr",
        0xb9 => "cpdr",
        0xba => "indr",
        0xbb => "otdr",
        _ => "",
    };
    if !fixed.is_empty() {
        return (fixed.to_string(), 2);
    }

    if op & 0xc7 == 0x40 {
        let reg = (op >> 3) & 0x7;
        let text = if reg == 6 { "in     (c)".to_string() } else { format!("in     {}, (c)", REGS8[reg as usize]) };
        return (text, 2);
    }
    if op & 0xc7 == 0x41 {
        let reg = (op >> 3) & 0x7;
        let text = if reg == 6 { "out    (c), 0".to_string() } else { format!("out    (c), {}", REGS8[reg as usize]) };
        return (text, 2);
    }
    if op & 0xcf == 0x42 {
        return (format!("sbc    hl, {}", pair), 2);
    }
    if op & 0xcf == 0x4a {
        return (format!("adc    hl, {}", pair), 2);
    }
    if op & 0xcf == 0x4b {
        let word = opcodes[2] as u16 | (opcodes[3] as u16) << 8;
        let operand = lookup(word).unwrap_or_else(|| format!("0x{:04x}", word));
        return (format!("ld     {}, ({})", pair, operand), 4);
    }
    if op & 0xcf == 0x43 {
        let word = opcodes[2] as u16 | (opcodes[3] as u16) << 8;
        let operand = lookup(word).unwrap_or_else(|| format!("0x{:04x}", word));
        return (format!("ld     ({}), {}", operand, pair), 4);
    }

    ("ill".to_string(), 2)
}

fn decode_index(opcodes: &[u8; 4], reg: char) -> (String, usize) {
    let op = opcodes[1];
    let disp = opcodes[2] as i8;
    let ireg = format!("i{}", reg);

    let text_size: (String, usize) = match op {
        0x09 | 0x19 | 0x29 | 0x39 => {
            let pair = match op {
                0x09 => "bc".to_string(),
                0x19 => "de".to_string(),
                0x29 => ireg.clone(),
                _ => "sp".to_string(),
            };
            (format!("add    {}, {}", ireg, pair), 2)
        }
        0x21 => {
            let word = opcodes[2] as u16 | (opcodes[3] as u16) << 8;
            (format!("ld     {}, 0x{:04x}", ireg, word), 4)
        }
        0x22 => {
            let word = opcodes[2] as u16 | (opcodes[3] as u16) << 8;
            (format!("ld     (0x{:04x}), {}", word, ireg), 4)
        }
        0x2a => {
            let word = opcodes[2] as u16 | (opcodes[3] as u16) << 8;
            (format!("ld     {}, (0x{:04x})", ireg, word), 4)
        }
        0x23 => (format!("inc    {}", ireg), 2),
        0x2b => (format!("dec    {}", ireg), 2),
        0x24 => (format!("inc    {}h", ireg), 2),
        0x25 => (format!("dec    {}h", ireg), 2),
        0x2c => (format!("inc    {}l", ireg), 2),
        0x2d => (format!("dec    {}l", ireg), 2),
        0x26 => (format!("ld     {}h, 0x{:x}", ireg, opcodes[2]), 3),
        0x2e => (format!("ld     {}l, 0x{:x}", ireg, opcodes[2]), 3),
        0x34 => (format!("inc    ({}{:+})", ireg, disp), 3),
        0x35 => (format!("dec    ({}{:+})", ireg, disp), 3),
        0x36 => (format!("ld     ({}{:+}), 0x{:x}", ireg, disp, opcodes[3]), 4),
        0x46 | 0x4e | 0x56 | 0x5e | 0x66 | 0x6e | 0x7e => {
            let dst = REGS8[((op >> 3) & 0x7) as usize];
            (format!("ld     {}, ({}{:+})", dst, ireg, disp), 3)
        }
        0x70..=0x77 if op != 0x76 => {
            let src = REGS8[(op & 0x7) as usize];
            (format!("ld     ({}{:+}), {}", ireg, disp, src), 3)
        }
        0x86 => (format!("add    a, ({}{:+})", ireg, disp), 3),
        0x8e => (format!("adc    a, ({}{:+})", ireg, disp), 3),
        0x96 => (format!("sub    ({}{:+})", ireg, disp), 3),
        0x9e => (format!("sbc    a, ({}{:+})", ireg, disp), 3),
        0xa6 => (format!("and    ({}{:+})", ireg, disp), 3),
        0xae => (format!("xor    ({}{:+})", ireg, disp), 3),
        0xb6 => (format!("or     ({}{:+})", ireg, disp), 3),
        0xbe => (format!("cp     ({}{:+})", ireg, disp), 3),
        0xe1 => (format!("pop    {}", ireg), 2),
        0xe3 => (format!("ex     (sp), {}", ireg), 2),
        0xe5 => (format!("push   {}", ireg), 2),
        0xe9 => (format!("jp     ({})", ireg), 2),
        0xf9 => (format!("ld     sp, {}", ireg), 2),
        0xcb => {
            // DDCB/FDCB: displacement precedes the operation byte
            (decode_cb(opcodes[3], Some((reg, opcodes[2]))), 4)
        }
        _ => ("ill".to_string(), 2),
    };

    text_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dis(bytes: &[u8]) -> (String, usize) {
        let mut opcodes = [0u8; 4];
        opcodes[..bytes.len()].copy_from_slice(bytes);
        disassemble(&opcodes, 0x100, |_| None)
    }

    #[test]
    fn main_page() {
        assert_eq!(dis(&[0x00]), ("nop".to_string(), 1));
        assert_eq!(dis(&[0x21, 0x34, 0x12]), ("ld     hl, 0x1234".to_string(), 3));
        assert_eq!(dis(&[0x3e, 0x7f]), ("ld     a, 0x7f".to_string(), 2));
    }

    #[test]
    fn relative_jump_target() {
        // jr -2 at 0x100 loops onto itself
        assert_eq!(dis(&[0x18, 0xfe]), ("jr     0x0100".to_string(), 2));
    }

    #[test]
    fn cb_page() {
        assert_eq!(dis(&[0xcb, 0x27]), ("sla    a".to_string(), 2));
        assert_eq!(dis(&[0xcb, 0x46]), ("bit    0, (hl)".to_string(), 2));
        assert_eq!(dis(&[0xcb, 0xde]), ("set    3, (hl)".to_string(), 2));
    }

    #[test]
    fn ed_page() {
        assert_eq!(dis(&[0xed, 0xb0]), ("ldir".to_string(), 2));
        assert_eq!(dis(&[0xed, 0x4b, 0x00, 0x80]), ("ld     bc, (0x8000)".to_string(), 4));
        assert_eq!(dis(&[0xed, 0x43, 0x00, 0x80]), ("ld     (0x8000), bc".to_string(), 4));
    }

    #[test]
    fn index_pages() {
        assert_eq!(dis(&[0xdd, 0x21, 0x00, 0x40]), ("ld     ix, 0x4000".to_string(), 4));
        assert_eq!(dis(&[0xfd, 0x7e, 0x05]), ("ld     a, (iy+5)".to_string(), 3));
        assert_eq!(dis(&[0xdd, 0xcb, 0xff, 0xc6]), ("set    0, (ix-1)".to_string(), 4));
    }

    #[test]
    fn symbol_substitution() {
        let mut opcodes = [0u8; 4];
        opcodes[..3].copy_from_slice(&[0xcd, 0x00, 0x80]);
        let (text, _) = disassemble(&opcodes, 0, |addr| {
            (addr == 0x8000).then(|| "entry".to_string())
        });
        assert_eq!(text, "call   entry");
    }

    #[test]
    fn sizes_for_step_over() {
        assert_eq!(instruction_size(&[0xcd, 0, 0, 0]), 3);
        assert_eq!(instruction_size(&[0xdd, 0x36, 0, 0]), 4);
        assert_eq!(instruction_size(&[0xed, 0xa0, 0, 0]), 2);
        assert_eq!(instruction_size(&[0x76, 0, 0, 0]), 1);
    }
}
