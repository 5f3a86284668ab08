//! Human-readable program listing, backing the CLI `-d` flag.

use std::fmt::Write;

use crate::program::Program;

pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    if !program.directives.is_empty() {
        let _ = writeln!(out, "directives: {}", program.directives.join(", "));
    }
    if !program.permissions.is_empty() {
        let _ = writeln!(out, "permissions: {}", program.permissions);
    }

    if !program.constants.is_empty() {
        let _ = writeln!(out, "constants:");
        for (i, k) in program.constants.iter().enumerate() {
            let _ = writeln!(out, "  k{i:<4} {} {}", k.type_of(), k);
        }
    }

    for e in &program.enums {
        let _ = writeln!(out, "enum {}:", e.name);
        for v in &e.values {
            let _ = writeln!(out, "  {} -> k{}", v.name, v.k_index);
        }
    }

    for c in &program.classes {
        let exported = if c.exported { " exported" } else { "" };
        let _ = writeln!(out, "class {}{exported}:", c.name);
        for field in &c.fields {
            let _ = writeln!(out, "  field {}", field.name);
        }
        for m in &c.methods {
            let _ = writeln!(out, "  method {} -> f{}", m.name, m.func_index);
        }
    }

    for f in &program.functions {
        let exported = if f.exported { " exported" } else { "" };
        let _ = writeln!(
            out,
            "function {} (index {}, args {}+{}, registers {}){exported}:",
            f.name, f.index, f.arguments, f.optional_arguments, f.max_registers
        );
        for (pc, instr) in f.instructions.iter().enumerate() {
            let line = f.line(pc);
            if line > 0 {
                let _ = writeln!(out, "  {pc:4}  {instr}  ; line {line}");
            } else {
                let _ = writeln!(out, "  {pc:4}  {instr}");
            }
        }
    }

    if !program.resources.is_empty() {
        let _ = writeln!(out, "resources:");
        let mut names: Vec<&String> = program.resources.keys().collect();
        names.sort();
        for name in names {
            let _ = writeln!(out, "  {name} ({} bytes)", program.resources[name].len());
        }
    }

    out
}
