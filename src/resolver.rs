//! Backward stack-slice solver: given an index of a call to a
//! producer-returning API, reconstructs the value that was pushed as the
//! Nth argument below the call.

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use once_cell::sync::Lazy;

use crate::bytecode::{Instruction, MethodDef, Opcode, Operand, ParsedModule};

pub const MAX_RESOLUTION_DEPTH: u8 = 16;

static EXECUTABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[A-Za-z0-9._-]+\.(exe|bat|cmd|com|ps1|msi)$").unwrap());

/// A reconstructed producer value. `marker` results (unresolved locals,
/// fields, arguments) are ranked below concrete literals when several
/// resolutions are being compared.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub text: String,
    pub is_concrete_literal: bool,
}

impl ResolvedValue {
    fn literal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_concrete_literal: true,
        }
    }

    fn marker(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_concrete_literal: false,
        }
    }

    /// Higher is a better candidate: a concrete literal naming an
    /// executable beats any other concrete literal, which beats a marker.
    pub fn candidate_score(&self) -> u8 {
        match (self.is_concrete_literal, EXECUTABLE_NAME.is_match(&self.text)) {
            (true, true) => 2,
            (true, false) => 1,
            (false, _) => 0,
        }
    }
}

struct ResolutionState<'a> {
    module: &'a ParsedModule,
    method: &'a MethodDef,
    arg_map: Option<&'a FxHashMap<u16, String>>,
    visited_methods: FxHashSet<String>,
    visited_fields: FxHashSet<String>,
    depth: u8,
}

/// Walks backward from `call_index` to find the instruction that produced
/// the Nth value below the call (`n = 1` is the top of stack / last pushed
/// argument), then resolves that producer to a textual value.
pub fn resolve_argument(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
    n: u16,
) -> ResolvedValue {
    let mut state = ResolutionState {
        module,
        method,
        arg_map: None,
        visited_methods: FxHashSet::default(),
        visited_fields: FxHashSet::default(),
        depth: 0,
    };
    resolve_argument_with_arg_map(&mut state, instructions, call_index, n)
}

pub fn resolve_argument_with_map(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
    n: u16,
    arg_map: &FxHashMap<u16, String>,
) -> ResolvedValue {
    let mut state = ResolutionState {
        module,
        method,
        arg_map: Some(arg_map),
        visited_methods: FxHashSet::default(),
        visited_fields: FxHashSet::default(),
        depth: 0,
    };
    resolve_argument_with_arg_map(&mut state, instructions, call_index, n)
}

fn resolve_argument_with_arg_map(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    call_index: usize,
    n: u16,
) -> ResolvedValue {
    match find_producer_index(instructions, call_index, n) {
        Some(idx) => resolve_producer(state, instructions, idx),
        None => ResolvedValue::marker("<unresolved>"),
    }
}

/// The backward-walk algorithm: `needed` starts at `n`; each
/// instruction's push count is subtracted, then (if `needed` is still
/// positive) its pop count is added back before moving further backward.
fn find_producer_index(instructions: &[Instruction], call_index: usize, n: u16) -> Option<usize> {
    let mut needed: i32 = n as i32;
    let mut idx = call_index;
    while idx > 0 {
        idx -= 1;
        let (pops, pushes) = instructions[idx].stack_delta();
        needed -= pushes as i32;
        if needed <= 0 {
            return Some(idx);
        }
        needed += pops as i32;
    }
    None
}

fn resolve_producer(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    idx: usize,
) -> ResolvedValue {
    if state.depth >= MAX_RESOLUTION_DEPTH {
        return ResolvedValue::marker("<depth-exceeded>");
    }
    state.depth += 1;
    let result = resolve_producer_inner(state, instructions, idx);
    state.depth -= 1;
    result
}

fn resolve_producer_inner(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    idx: usize,
) -> ResolvedValue {
    let instr = &instructions[idx];
    match (&instr.opcode, &instr.operand) {
        (Opcode::LdStr, Operand::String(s)) => ResolvedValue::literal(s.clone()),
        (Opcode::LdcI4, Operand::Int(v)) => ResolvedValue::literal(v.to_string()),
        (Opcode::LdcI4, Operand::SByte(v)) => ResolvedValue::literal(v.to_string()),
        (Opcode::LdNull, _) => ResolvedValue::literal("null"),
        (Opcode::Box, _) => match find_producer_index(instructions, idx, 1) {
            Some(inner) => resolve_producer(state, instructions, inner),
            None => ResolvedValue::marker("<boxed>"),
        },
        (Opcode::LdLoc(i), _) => resolve_local(state, instructions, idx, *i),
        (Opcode::LdArg(i), _) => resolve_argument_load(state, *i),
        (Opcode::LdFld(f), _) | (Opcode::LdsFld(f), _) => {
            resolve_field(state, instructions, idx, f)
        }
        (Opcode::Call, Operand::Method(m)) | (Opcode::CallVirt, Operand::Method(m)) => {
            resolve_call(state, instructions, idx, m)
        }
        (Opcode::NewObj, Operand::Method(m)) if m.declaring_type.ends_with("ProcessStartInfo") => {
            resolve_argument_with_arg_map(state, instructions, idx, 1)
        }
        (Opcode::NewObj, Operand::Method(m)) => {
            ResolvedValue::marker(format!("<new {}>", m.declaring_type))
        }
        _ => ResolvedValue::marker("<unresolved>"),
    }
}

fn resolve_local(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    before: usize,
    local_index: u16,
) -> ResolvedValue {
    for i in (0..before).rev() {
        if let (Opcode::StLoc(stored), _) = (&instructions[i].opcode, &instructions[i].operand) {
            if *stored == local_index {
                return match find_producer_index(instructions, i, 1) {
                    Some(p) => resolve_producer(state, instructions, p),
                    None => ResolvedValue::marker(format!("<local V_{local_index}>")),
                };
            }
        }
    }
    ResolvedValue::marker(format!("<local V_{local_index}>"))
}

fn resolve_argument_load(state: &ResolutionState<'_>, arg_index: u16) -> ResolvedValue {
    if let Some(map) = state.arg_map {
        if let Some(v) = map.get(&arg_index) {
            return ResolvedValue::literal(v.clone());
        }
    }
    ResolvedValue::marker(format!("<arg {arg_index}>"))
}

fn resolve_field(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    before: usize,
    field: &crate::bytecode::FieldRef,
) -> ResolvedValue {
    let key = format!("{}.{}", field.declaring_type, field.name);
    if state.visited_fields.contains(&key) {
        return ResolvedValue::marker(format!("<field {}>", field.name));
    }
    state.visited_fields.insert(key);

    // Same-method store first.
    for i in (0..before).rev() {
        let matches = match &instructions[i].opcode {
            Opcode::StFld(f) | Opcode::StsFld(f) => f.name == field.name && f.declaring_type == field.declaring_type,
            _ => false,
        };
        if matches {
            return match find_producer_index(instructions, i, 1) {
                Some(p) => resolve_producer(state, instructions, p),
                None => ResolvedValue::marker(format!("<field {}>", field.name)),
            };
        }
    }

    // Module-wide search for the best candidate store (static or instance).
    for type_def in all_types(state.module) {
        for method in &type_def.methods {
            let Some(body) = &method.instructions else {
                continue;
            };
            for (i, candidate) in body.iter().enumerate() {
                let matches = match &candidate.opcode {
                    Opcode::StFld(f) | Opcode::StsFld(f) => {
                        f.name == field.name && f.declaring_type == field.declaring_type
                    }
                    _ => false,
                };
                if matches {
                    return match find_producer_index(body, i, 1) {
                        Some(p) => resolve_producer(state, body, p),
                        None => ResolvedValue::marker(format!("<field {}>", field.name)),
                    };
                }
            }
        }
    }

    ResolvedValue::marker(format!("<field {}>", field.name))
}

fn all_types(module: &ParsedModule) -> Vec<&crate::bytecode::TypeDef> {
    fn walk<'a>(types: &'a [crate::bytecode::TypeDef], out: &mut Vec<&'a crate::bytecode::TypeDef>) {
        for t in types {
            out.push(t);
            walk(&t.nested_types, out);
        }
    }
    let mut out = Vec::new();
    walk(&module.types, &mut out);
    out
}

fn resolve_call(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    idx: usize,
    m: &crate::bytecode::MethodRef,
) -> ResolvedValue {
    match (m.declaring_type.as_str(), m.name.as_str()) {
        ("System.IO.Path", "Combine") | ("System.IO.Path", "Join") => {
            let first = resolve_argument_with_arg_map(state, instructions, idx, 2);
            let second = resolve_argument_with_arg_map(state, instructions, idx, 1);
            ResolvedValue::literal(format!("{}\\{}", first.text, second.text))
        }
        ("System.IO.Path", "GetFullPath") | ("System.IO.Path", "GetFileName") => {
            resolve_argument_with_arg_map(state, instructions, idx, 1)
        }
        ("System.IO.Path", "GetTempPath") => ResolvedValue::literal("%TEMP%"),
        ("System.String", "Concat") => {
            let (pops, _) = instructions[idx].stack_delta();
            let mut parts = Vec::new();
            for n in (1..=pops).rev() {
                parts.push(resolve_argument_with_arg_map(state, instructions, idx, n).text);
            }
            ResolvedValue::literal(parts.join(""))
        }
        ("System.String", "Format") => resolve_string_format(state, instructions, idx, m),
        ("System.Guid", "NewGuid") => ResolvedValue::marker("<guid>"),
        _ => resolve_defined_method_return(state, m),
    }
}

fn resolve_string_format(
    state: &mut ResolutionState<'_>,
    instructions: &[Instruction],
    idx: usize,
    m: &crate::bytecode::MethodRef,
) -> ResolvedValue {
    let arity = m.param_count;
    if arity < 2 {
        return ResolvedValue::marker("<format>");
    }
    let fmt = resolve_argument_with_arg_map(state, instructions, idx, arity);
    let mut args = Vec::new();
    for n in (1..arity).rev() {
        args.push(resolve_argument_with_arg_map(state, instructions, idx, n).text);
    }
    let mut out = fmt.text;
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("{{{i}}}"), arg);
    }
    ResolvedValue::literal(out)
}

fn resolve_defined_method_return(
    state: &mut ResolutionState<'_>,
    m: &crate::bytecode::MethodRef,
) -> ResolvedValue {
    let key = m.full_name();
    if state.visited_methods.contains(&key) {
        return ResolvedValue::marker(format!("<{key}>"));
    }
    let Some((owner_type, target)) = find_method(state.module, &m.declaring_type, &m.name) else {
        return ResolvedValue::marker(format!("<{key}>"));
    };
    let _ = owner_type;
    state.visited_methods.insert(key.clone());

    let Some(body) = &target.instructions else {
        return ResolvedValue::marker(format!("<{key}>"));
    };
    // Resolve the value returned by the last producing instruction before
    // the method's final `ret`-equivalent position (end of body).
    match find_producer_index(body, body.len(), 1) {
        Some(p) => resolve_producer(state, body, p),
        None => ResolvedValue::marker(format!("<{key}>")),
    }
}

fn find_method<'a>(
    module: &'a ParsedModule,
    declaring_type: &str,
    name: &str,
) -> Option<(&'a crate::bytecode::TypeDef, &'a MethodDef)> {
    for t in all_types(module) {
        if t.full_name() == declaring_type {
            if let Some(method) = t.methods.iter().find(|mm| mm.name == name) {
                return Some((t, method));
            }
        }
    }
    None
}

/// Walks back to a `ProcessStartInfo.set_FileName` call or the first
/// argument of `Process.Start`.
pub fn try_resolve_process_target(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter_or_first_arg(module, method, instructions, call_index, "set_FileName")
}

pub fn try_resolve_process_arguments(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter_or_first_arg(module, method, instructions, call_index, "set_Arguments")
}

pub fn try_resolve_use_shell_execute(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter(module, method, instructions, call_index, "set_UseShellExecute")
}

pub fn try_resolve_create_no_window(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter(module, method, instructions, call_index, "set_CreateNoWindow")
}

pub fn try_resolve_window_style(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter(module, method, instructions, call_index, "set_WindowStyle")
}

pub fn try_resolve_working_directory(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
) -> Option<ResolvedValue> {
    resolve_setter(module, method, instructions, call_index, "set_WorkingDirectory")
}

fn resolve_setter(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
    setter_name: &str,
) -> Option<ResolvedValue> {
    for i in (0..call_index).rev() {
        if let Operand::Method(m) = &instructions[i].operand {
            if m.name == setter_name && m.declaring_type.ends_with("ProcessStartInfo") {
                let mut state = ResolutionState {
                    module,
                    method,
                    arg_map: None,
                    visited_methods: FxHashSet::default(),
                    visited_fields: FxHashSet::default(),
                    depth: 0,
                };
                return Some(resolve_argument_with_arg_map(&mut state, instructions, i, 1));
            }
        }
    }
    None
}

fn resolve_setter_or_first_arg(
    module: &ParsedModule,
    method: &MethodDef,
    instructions: &[Instruction],
    call_index: usize,
    setter_name: &str,
) -> Option<ResolvedValue> {
    if let Some(v) = resolve_setter(module, method, instructions, call_index, setter_name) {
        return Some(v);
    }
    if let Operand::Method(m) = &instructions[call_index].operand {
        if m.declaring_type == "System.Diagnostics.Process" && m.name == "Start" {
            let n = m.param_count;
            if n == 0 {
                return None;
            }
            return Some(resolve_argument(module, method, instructions, call_index, n));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FieldRef, MethodRef, Opcode, Operand};

    fn str_instr(offset: u32, s: &str) -> Instruction {
        Instruction::new(offset, Opcode::LdStr, Operand::String(s.to_string()))
    }

    fn call_instr(offset: u32, declaring_type: &str, name: &str, params: u16, returns_void: bool) -> Instruction {
        Instruction::new(
            offset,
            Opcode::Call,
            Operand::Method(MethodRef {
                declaring_type: declaring_type.into(),
                name: name.into(),
                param_count: params,
                has_this: false,
                returns_void,
            }),
        )
    }

    fn empty_module() -> ParsedModule {
        ParsedModule {
            assembly_name: "Test".into(),
            assembly_version: "1.0.0.0".into(),
            module_name: "Test.dll".into(),
            types: vec![],
            resources: vec![],
            module_refs: vec![],
            pinvoke_decls: vec![],
            custom_attributes: vec![],
        }
    }

    fn empty_method() -> MethodDef {
        MethodDef {
            name: "M".into(),
            declaring_type: "X.Y".into(),
            param_count: 0,
            has_this: false,
            returns_void: true,
            instructions: None,
            locals: vec![],
            exception_handlers: vec![],
            is_static_constructor: false,
        }
    }

    #[test]
    fn resolves_literal_argument() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            str_instr(0, "notepad.exe"),
            call_instr(1, "System.Diagnostics.Process", "Start", 1, true),
        ];
        let resolved = resolve_argument(&module, &method, &seq, 1, 1);
        assert_eq!(resolved.text, "notepad.exe");
        assert!(resolved.is_concrete_literal);
    }

    #[test]
    fn resolves_through_local_store_and_load() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            str_instr(0, "cmd.exe"),
            Instruction::new(1, Opcode::StLoc(0), Operand::None),
            Instruction::new(2, Opcode::LdLoc(0), Operand::None),
            call_instr(3, "System.Diagnostics.Process", "Start", 1, true),
        ];
        let resolved = resolve_argument(&module, &method, &seq, 3, 1);
        assert_eq!(resolved.text, "cmd.exe");
    }

    #[test]
    fn path_combine_joins_two_literals() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            str_instr(0, "%TEMP%"),
            str_instr(1, "evil.exe"),
            call_instr(2, "System.IO.Path", "Combine", 2, false),
        ];
        let resolved = resolve_argument(&module, &method, &seq, 2, 1);
        assert_eq!(resolved.text, "%TEMP%\\evil.exe");
    }

    #[test]
    fn unresolved_local_falls_back_to_marker() {
        let module = empty_module();
        let method = empty_method();
        let seq = vec![
            Instruction::new(0, Opcode::LdLoc(3), Operand::None),
            call_instr(1, "System.Diagnostics.Process", "Start", 1, true),
        ];
        let resolved = resolve_argument(&module, &method, &seq, 1, 1);
        assert_eq!(resolved.text, "<local V_3>");
        assert!(!resolved.is_concrete_literal);
    }

    #[test]
    fn field_load_searches_module_wide_store() {
        let mut module = empty_module();
        let storing_method = MethodDef {
            name: "Init".into(),
            instructions: Some(vec![
                str_instr(0, "payload.dll"),
                Instruction::new(
                    1,
                    Opcode::StsFld(FieldRef {
                        declaring_type: "X.Y".into(),
                        name: "_target".into(),
                        is_static: true,
                    }),
                    Operand::None,
                ),
            ]),
            ..empty_method()
        };
        module.types.push(crate::bytecode::TypeDef {
            namespace: "X".into(),
            name: "Y".into(),
            nested_types: vec![],
            methods: vec![storing_method],
            properties: vec![],
            events: vec![],
            custom_attributes: vec![],
        });

        let method = empty_method();
        let seq = vec![
            Instruction::new(
                0,
                Opcode::LdsFld(FieldRef {
                    declaring_type: "X.Y".into(),
                    name: "_target".into(),
                    is_static: true,
                }),
                Operand::None,
            ),
            call_instr(1, "System.Diagnostics.Process", "Start", 1, true),
        ];
        let resolved = resolve_argument(&module, &method, &seq, 1, 1);
        assert_eq!(resolved.text, "payload.dll");
    }

    #[test]
    fn candidate_scoring_prefers_executable_literal() {
        let exe = ResolvedValue::literal("payload.exe");
        let other_literal = ResolvedValue::literal("hello");
        let marker = ResolvedValue::marker("<arg 0>");
        assert!(exe.candidate_score() > other_literal.candidate_score());
        assert!(other_literal.candidate_score() > marker.candidate_score());
    }
}
