//! Reference balance, shared code caches, modules and configuration

mod common;
use avm2::bytecode::{
    CodeBuilder, ConstantPoolData, ExceptionInfo, MethodBody, MethodInfo, Module, Opcode,
};
use avm2::jit::{compile, CodeCache, CompilationTier};
use avm2::runtime::{Object, StandardModel};
use avm2::{Error, JitMode, Value, VmConfig, VmContext};
use common::*;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

fn both_tiers() -> [VmConfig; 2] {
    [VmConfig::interpreter_only(), VmConfig::jit_always()]
}

mod reference_balance {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracked() -> (Value, usize) {
        let value = Value::new_object(Object::plain());
        let count = Rc::strong_count(value.as_object().unwrap());
        (value, count)
    }

    #[test]
    fn test_stack_and_local_traffic_is_balanced() {
        // copy the argument through locals and every stack shuffle
        let mut b = CodeBuilder::new();
        b.get_local(1).set_local(2);
        b.get_local(1).op(Opcode::Dup).op(Opcode::Pop);
        b.get_local(2).op(Opcode::Swap).op(Opcode::Pop);
        b.op_u30(Opcode::Kill, 2).op(Opcode::ReturnValue);
        let m = untyped(method("shuffle", &mut b, 2, 3), 1);

        for config in both_tiers() {
            let (value, baseline) = tracked();
            let vm = vm(vec![m.clone()], ConstantPoolData::new(), config);
            let result = vm.invoke(0, Value::Null, vec![value.clone()]).unwrap();
            assert!(result.strict_equals(&value));
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline + 1);
            drop(result);
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline);
        }
    }

    #[test]
    fn test_loop_carried_object_is_balanced() {
        // the object is stored into local 2 on every iteration
        let mut b = CodeBuilder::new();
        let (top, test) = (b.new_label(), b.new_label());
        b.push_byte(0).set_local(3).jump(test);
        b.bind(top).op(Opcode::Label);
        b.get_local(1).set_local(2);
        b.get_local(3).op(Opcode::IncrementI).set_local(3);
        b.bind(test).get_local(3).push_byte(5).branch(Opcode::IfLt, top);
        b.op(Opcode::ReturnVoid);
        let m = untyped(method("loop", &mut b, 2, 4), 1);

        for config in both_tiers() {
            let (value, baseline) = tracked();
            let vm = vm(vec![m.clone()], ConstantPoolData::new(), config);
            vm.invoke(0, Value::Null, vec![value.clone()]).unwrap();
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline);
        }
    }

    #[test]
    fn test_caught_throw_releases_everything() {
        // local2 = arg; throw arg; handler drops the exception
        let mut b = CodeBuilder::new();
        b.get_local(1).set_local(2).get_local(1).op(Opcode::Throw);
        let target = b.here();
        b.op(Opcode::Pop).op(Opcode::ReturnVoid);
        let body = MethodBody::new(b.finish().unwrap(), 2, 3).with_exceptions(vec![
            ExceptionInfo {
                from: 0,
                to: target,
                target,
                exc_type: 0,
                var_name: 0,
            },
        ]);
        let m = untyped(MethodInfo::new("caught", body), 1);

        for config in both_tiers() {
            let (value, baseline) = tracked();
            let vm = vm(vec![m.clone()], ConstantPoolData::new(), config);
            vm.invoke(0, Value::Null, vec![value.clone()]).unwrap();
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline);
        }
    }

    #[test]
    fn test_escaping_throw_owns_exactly_one_reference() {
        let mut b = CodeBuilder::new();
        b.get_local(1).set_local(2).get_local(2).op(Opcode::Throw);
        let m = untyped(method("escapes", &mut b, 1, 3), 1);

        for config in both_tiers() {
            let (value, baseline) = tracked();
            let vm = vm(vec![m.clone()], ConstantPoolData::new(), config);
            let err = vm.invoke(0, Value::Null, vec![value.clone()]).unwrap_err();
            assert!(matches!(&err, Error::Thrown(thrown) if thrown.strict_equals(&value)));
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline + 1);
            drop(err);
            assert_eq!(Rc::strong_count(value.as_object().unwrap()), baseline);
        }
    }
}

mod code_cache {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loop_method() -> MethodInfo {
        let mut b = CodeBuilder::new();
        let (top, test) = (b.new_label(), b.new_label());
        b.push_byte(0).set_local(1).jump(test);
        b.bind(top).op(Opcode::Label);
        b.get_local(1).op(Opcode::IncrementI).set_local(1);
        b.bind(test).get_local(1).push_byte(100).branch(Opcode::IfLt, top);
        b.get_local(1).op(Opcode::ReturnValue);
        method("count", &mut b, 2, 2)
    }

    #[test]
    fn test_threads_publish_one_compiled_method() {
        let cache = Arc::new(CodeCache::new());
        let method = Arc::new(loop_method());
        let pool = Arc::new(ConstantPoolData::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cache, method, pool) = (cache.clone(), method.clone(), pool.clone());
                thread::spawn(move || {
                    cache
                        .get_or_compile(0, || compile(&method, &*pool))
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for compiled in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], compiled));
        }
        assert_eq!(cache.publish_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_vms_share_a_cache() {
        let cache = Arc::new(CodeCache::new());
        let build = || {
            VmContext::builder()
                .pool(Arc::new(ConstantPoolData::new()))
                .method(loop_method())
                .model(Rc::new(StandardModel::new()))
                .config(VmConfig::jit_always())
                .cache(cache.clone())
                .build()
                .unwrap()
        };
        let (first, second) = (build(), build());

        assert_eq!(first.invoke(0, Value::Null, Vec::new()).unwrap().to_number(), 100.0);
        assert_eq!(second.tier_of(0), CompilationTier::Compiled);
        assert_eq!(second.invoke(0, Value::Null, Vec::new()).unwrap().to_number(), 100.0);
        assert_eq!(cache.compile_attempts(), 1);
    }

    #[test]
    fn test_cached_code_matches_fresh_compile() {
        let method = loop_method();
        let pool = ConstantPoolData::new();
        let cache = CodeCache::new();
        let cached = cache.get_or_compile(0, || compile(&method, &pool)).unwrap();
        let fresh = compile(&method, &pool).unwrap();
        assert_eq!(cached.lowered.ir, fresh.lowered.ir);
        assert_eq!(cached.lowered.labels, fresh.lowered.labels);
    }
}

mod modules {
    use super::*;
    use pretty_assertions::assert_eq;

    const MODULE: &str = r#"{
        "pool": {
            "strings": ["trace", "hello"],
            "multinames": [{ "name": "trace" }]
        },
        "methods": [
            { "name": "sub", "body": { "code": [36, 5, 36, 3, 161, 72], "max_stack": 2, "local_count": 1 } },
            { "name": "greet", "body": { "code": [93, 1, 44, 2, 79, 1, 1, 71], "max_stack": 2, "local_count": 1 } }
        ],
        "entry": "greet"
    }"#;

    fn module_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MODULE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_module_runs_in_both_tiers() {
        let file = module_file();
        for config in both_tiers() {
            let module = Module::from_file(file.path()).unwrap();
            let sub = module.method_index("sub").unwrap();
            let entry = module.entry_method().unwrap();
            assert_eq!((sub, entry), (0, 1));

            let model = Rc::new(StandardModel::new());
            let vm = module.into_vm(config, model.clone()).unwrap();
            assert_eq!(vm.method_by_name("greet"), Some(1));
            assert_eq!(vm.invoke(sub, Value::Null, Vec::new()).unwrap().to_number(), 2.0);
            let result = vm.invoke(entry, Value::Null, Vec::new()).unwrap();
            assert!(matches!(result, Value::Undefined));
            assert_eq!(model.take_output(), vec!["hello".to_string()]);
        }
    }

    #[test]
    fn test_malformed_module_is_rejected() {
        assert!(matches!(
            Module::from_json_str(r#"{ "methods": 3 }"#),
            Err(Error::ModuleError(_))
        ));
    }

    #[test]
    fn test_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "jit": "off", "max_call_depth": 4 }"#).unwrap();
        let config = VmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.jit, JitMode::Off);
        assert_eq!(config.max_call_depth, 4);
        assert_eq!(config.jit_threshold, VmConfig::default().jit_threshold);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "max_call_depth": 0 }"#).unwrap();
        assert!(matches!(VmConfig::from_file(file.path()), Err(Error::ConfigError(_))));
    }
}
