//! Integration tests for the Lua bridge as seen from a host application.
//!
//! These tests go through the public API only: a [`ScriptVm`], native classes
//! registered on it, and the held-value wrappers.
//!
//! # Test Categories
//!
//! 1. **Classes**: inheritance, downcasting, wrapper identity, detaching
//! 2. **Calls**: bad receivers, strict and lenient arity
//! 3. **Values**: marshalling defaults, weak handles, tables and arrays
//! 4. **Errors**: script errors carry a stack trace

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use aberredscript::error::BridgeError;
use aberredscript::resources::lua_runtime::{
    BackRef, DynamicArray, DynamicTable, DynamicValue, Exposed, ScriptClass, ScriptFunction, ScriptVm,
    WeakScriptRef,
};
use aberredscript::resources::scriptconfig::ScriptConfig;
use mlua::prelude::*;

// =============================================================================
// Test Classes
// =============================================================================

struct Node {
    back_ref: BackRef,
    name: RefCell<String>,
}

impl Node {
    fn new(name: &str) -> Self {
        Self {
            back_ref: BackRef::new(),
            name: RefCell::new(name.to_string()),
        }
    }
}

impl Exposed for Node {
    fn back_ref(&self) -> &BackRef {
        &self.back_ref
    }
}

impl ScriptClass for Node {
    const TYPE_NAME: &'static str = "Node";
}

struct Sprite {
    base: Rc<Node>,
    back_ref: BackRef,
    frame: Cell<i32>,
}

impl Sprite {
    fn new(name: &str, frame: i32) -> Self {
        Self {
            base: Rc::new(Node::new(name)),
            back_ref: BackRef::new(),
            frame: Cell::new(frame),
        }
    }
}

impl Exposed for Sprite {
    fn back_ref(&self) -> &BackRef {
        &self.back_ref
    }

    fn base_object(self: Rc<Self>) -> Option<Rc<dyn Exposed>> {
        Some(self.base.clone())
    }
}

impl ScriptClass for Sprite {
    const TYPE_NAME: &'static str = "Sprite";
    const BASE_TYPE_NAME: Option<&'static str> = Some("Node");
}

fn register_classes(vm: &ScriptVm) {
    vm.register_class::<Node>()
        .unwrap()
        .constructor(|name: String| Node::new(&name))
        .unwrap()
        .method("name", |this: &Node| this.name.borrow().clone())
        .unwrap()
        .method("rename", |this: &Node, name: String| {
            *this.name.borrow_mut() = name;
        })
        .unwrap();
    vm.register_class::<Sprite>()
        .unwrap()
        .constructor(|name: String, frame: i32| Sprite::new(&name, frame))
        .unwrap()
        .method("frame", |this: &Sprite| this.frame.get())
        .unwrap()
        .method("same_node", |this: &Sprite, other: Rc<Node>| Rc::ptr_eq(&this.base, &other))
        .unwrap();
}

fn strict_vm() -> ScriptVm {
    let mut config = ScriptConfig::new();
    config.strict_arity = true;
    ScriptVm::with_config(&config).unwrap()
}

// =============================================================================
// Classes
// =============================================================================

#[test]
fn derived_objects_use_base_methods() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    vm.do_string(
        r#"
        hero = Sprite("hero", 4)
        hero:rename("player")
        result = hero:name() .. ":" .. hero:frame()
        "#,
        "inherit",
    )
    .unwrap();
    assert_eq!(vm.global::<String>("result"), "player:4");
}

#[test]
fn objects_downcast_along_the_class_chain() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    vm.do_string("sprite = Sprite('s', 1) node = Node('n')", "cast").unwrap();
    let lua = vm.lua();

    let sprite: DynamicValue = vm.global("sprite");
    let as_sprite = sprite.to_object::<Sprite>(lua).unwrap();
    let as_node = sprite.to_object::<Node>(lua).unwrap();
    assert!(Rc::ptr_eq(&as_sprite.base, &as_node));

    let node: DynamicValue = vm.global("node");
    assert!(node.to_object::<Node>(lua).is_some());
    assert!(node.to_object::<Sprite>(lua).is_none());
}

#[test]
fn derived_objects_pass_where_base_is_expected() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let same: bool = vm
        .lua()
        .load("local s = Sprite('x', 0) return s:same_node(s)")
        .eval()
        .unwrap();
    assert!(same);
}

#[test]
fn one_wrapper_per_native_object() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let node = Rc::new(Node::new("shared"));
    vm.set_global("a", node.clone()).unwrap();
    vm.set_global("b", node.clone()).unwrap();
    let same: bool = vm.lua().load("return rawequal(a, b)").eval().unwrap();
    assert!(same);

    let back: Option<Rc<Node>> = vm.global("a");
    assert!(Rc::ptr_eq(&back.unwrap(), &node));
}

#[test]
fn wrapper_is_recreated_after_collection() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let node = Rc::new(Node::new("temp"));
    vm.set_global("a", node.clone()).unwrap();
    assert_eq!(Rc::strong_count(&node), 2);

    vm.do_string("a = nil", "drop").unwrap();
    vm.collect_garbage().unwrap();
    assert_eq!(Rc::strong_count(&node), 1);

    vm.set_global("b", node.clone()).unwrap();
    let name: String = vm.lua().load("return b:name()").eval().unwrap();
    assert_eq!(name, "temp");
}

#[test]
fn detached_objects_stay_safe_to_call() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let node = Rc::new(Node::new("gone"));
    vm.set_global("n", node.clone()).unwrap();
    assert!(vm.detach(&node).unwrap());

    let count: i32 = vm.lua().load("return select('#', n:name())").eval().unwrap();
    assert_eq!(count, 0);
    assert_eq!(Rc::strong_count(&node), 1);
}

// =============================================================================
// Calls
// =============================================================================

#[test]
fn bad_receiver_returns_nothing() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let (dot_call, wrong_type): (i32, i32) = vm
        .lua()
        .load(
            r#"
            local n = Node("n")
            local a = select('#', n.name(5))
            local b = select('#', Sprite.frame(n))
            return a, b
            "#,
        )
        .eval()
        .unwrap();
    assert_eq!(dot_call, 0);
    assert_eq!(wrong_type, 0);
}

#[test]
fn lenient_arity_fills_defaults() {
    let vm = ScriptVm::new().unwrap();
    register_classes(&vm);
    let (name, frame): (String, i32) = vm
        .lua()
        .load("local s = Sprite() return s:name(), s:frame()")
        .eval()
        .unwrap();
    assert_eq!(name, "");
    assert_eq!(frame, 0);
}

#[test]
fn strict_arity_raises_script_errors() {
    let vm = strict_vm();
    register_classes(&vm);
    let err = vm.do_string("local s = Sprite('only name')", "strict").unwrap_err();
    assert!(err.to_string().contains("wrong number of arguments"));

    let add = ScriptFunction::from_fn(vm.lua(), |a: i32, b: i32| a + b).unwrap();
    vm.set_global("add", &add).unwrap();
    assert!(vm.do_string("add(1)", "strict_fn").is_err());
    assert!(vm.do_string("add(1, 2)", "strict_fn").is_ok());
}

// =============================================================================
// Values
// =============================================================================

#[test]
fn mismatched_values_read_as_defaults() {
    let vm = ScriptVm::new().unwrap();
    vm.do_string("s = 'abc' n = 12.9 t = {}", "values").unwrap();
    assert_eq!(vm.global::<i32>("s"), 0);
    assert_eq!(vm.global::<i32>("n"), 12);
    assert_eq!(vm.global::<String>("t"), "");
    assert_eq!(vm.global::<Vec<i32>>("missing"), Vec::<i32>::new());
}

#[test]
fn weak_handles_do_not_keep_values_alive() {
    let vm = ScriptVm::new().unwrap();
    vm.do_string("target = {}", "weak").unwrap();
    let lua = vm.lua();
    let weak = WeakScriptRef::new(lua, lua.globals().get::<LuaValue>("target").unwrap()).unwrap();

    vm.collect_garbage().unwrap();
    assert!(!weak.get(lua).unwrap().is_nil());

    vm.do_string("target = nil", "weak").unwrap();
    vm.collect_garbage().unwrap();
    assert!(weak.get(lua).unwrap().is_nil());
}

#[test]
fn held_tables_and_arrays_share_state_with_scripts() {
    let vm = ScriptVm::new().unwrap();
    vm.do_string("config = { speed = 3, tags = { 'a', 'b' } }", "tables").unwrap();
    let lua = vm.lua();

    let config: DynamicTable = vm.global("config");
    assert_eq!(config.get::<i32>(lua, "speed"), 3);
    let tags: DynamicArray = config.get_array(lua, "tags");
    tags.push(lua, "c").unwrap();
    config.set(lua, "speed", 5).unwrap();

    let summary: String = lua
        .load("return config.speed .. table.concat(config.tags)")
        .eval()
        .unwrap();
    assert_eq!(summary, "5abc");
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn script_errors_carry_a_stack_trace() {
    let vm = ScriptVm::new().unwrap();
    vm.do_string(
        r#"
        local function inner() error("deep failure") end
        function outer() inner() end
        "#,
        "trace",
    )
    .unwrap();
    let err = vm.call_multi("outer", ()).unwrap_err();
    match err {
        BridgeError::Script { message, traceback } => {
            assert!(message.contains("deep failure"));
            assert!(!traceback.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
}
