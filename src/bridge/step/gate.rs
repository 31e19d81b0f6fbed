//! Step-in gate table.
//!
//! A gate is a runtime function that may call out into foreign native code. Its probes read the
//! function pointers that may be called, each probe is an expression template over one of the
//! gate function arguments.

use crate::bridge::runtime::KnownModule;
use crate::version::Version;

/// One candidate function pointer read at a gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    /// Argument name, used when locals are available.
    pub arg: &'static str,
    /// Argument position, used to pick a register when they are not.
    pub index: usize,
    /// Expression with `{arg}` standing for the argument value.
    pub template: &'static str,
}

impl Probe {
    const fn new(arg: &'static str, index: usize, template: &'static str) -> Self {
        Self {
            arg,
            index,
            template,
        }
    }

    /// Expression evaluating this probe with `arg` as the argument expression.
    pub fn render(&self, arg: &str) -> String {
        self.template.replace("{arg}", arg)
    }
}

/// Static description of a step-in gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSpec {
    pub function: &'static str,
    pub module: KnownModule,
    /// The function may call out more than once in one pass.
    pub multiple_exits: bool,
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
    pub probes: &'static [Probe],
}

impl GateSpec {
    const fn runtime(function: &'static str, probes: &'static [Probe]) -> Self {
        Self {
            function,
            module: KnownModule::Runtime,
            multiple_exits: false,
            min_version: None,
            max_version: None,
            probes,
        }
    }

    const fn with_multiple_exits(mut self) -> Self {
        self.multiple_exits = true;
        self
    }

    const fn until(mut self, version: Version) -> Self {
        self.max_version = Some(version);
        self
    }

    const fn since(mut self, version: Version) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Return true if this gate exists in a runtime version, unknown version keeps every gate.
    pub fn applies_to(&self, version: Option<Version>) -> bool {
        version.map_or(true, |v| v.in_range(self.min_version, self.max_version))
    }
}

macro_rules! slot {
    ($arg: literal, $index: literal, $path: literal) => {
        Probe::new($arg, $index, concat!("((PyObject*){arg})->ob_type->", $path))
    };
}

const PY_CFUNCTION_CALL: &[Probe] = &[Probe::new(
    "func",
    0,
    "((PyObject*){arg})->ob_type == &PyCFunction_Type ? ((PyCFunctionObject*){arg})->m_ml->ml_meth : 0",
)];
const GETSET_GET: &[Probe] = &[Probe::new(
    "descr",
    0,
    "((PyGetSetDescrObject*){arg})->d_getset->get",
)];
const GETSET_SET: &[Probe] = &[Probe::new(
    "descr",
    0,
    "((PyGetSetDescrObject*){arg})->d_getset->set",
)];
const TYPE_CALL: &[Probe] = &[
    Probe::new("type", 0, "((PyTypeObject*){arg})->tp_new"),
    Probe::new("type", 0, "((PyTypeObject*){arg})->tp_init"),
];
const GENERIC_NEW: &[Probe] = &[Probe::new("type", 0, "((PyTypeObject*){arg})->tp_alloc")];
const PRINT: &[Probe] = &[slot!("op", 0, "tp_print")];
const GET_ATTR_STRING: &[Probe] = &[slot!("v", 0, "tp_getattr")];
const SET_ATTR_STRING: &[Probe] = &[slot!("v", 0, "tp_setattr")];
const GET_ATTR: &[Probe] = &[slot!("v", 0, "tp_getattr"), slot!("v", 0, "tp_getattro")];
const SET_ATTR: &[Probe] = &[slot!("v", 0, "tp_setattr"), slot!("v", 0, "tp_setattro")];
const REPR: &[Probe] = &[slot!("v", 0, "tp_repr")];
const HASH: &[Probe] = &[slot!("v", 0, "tp_hash")];
const CALL: &[Probe] = &[slot!("func", 0, "tp_call")];
const STR: &[Probe] = &[slot!("v", 0, "tp_str")];
const COMPARE_LEGACY: &[Probe] = &[
    slot!("v", 0, "tp_compare"),
    slot!("v", 0, "tp_richcompare"),
    slot!("w", 1, "tp_compare"),
    slot!("w", 1, "tp_richcompare"),
];
const RICH_COMPARE: &[Probe] = &[slot!("v", 0, "tp_richcompare"), slot!("w", 1, "tp_richcompare")];
const GET_ITER: &[Probe] = &[slot!("o", 0, "tp_iter")];
const ITER_NEXT: &[Probe] = &[slot!("iter", 0, "tp_iternext")];
const BUILTIN_NEXT: &[Probe] = &[Probe::new(
    "args",
    1,
    "((PyTupleObject*){arg})->ob_item[0]->ob_type->tp_iternext",
)];
const CALL_FUNCTION_POINTER: &[Probe] = &[Probe::new("pProc", 1, "{arg}")];

const V2_7: Version = Version((2, 7, 0));
const V3_3: Version = Version((3, 3, 0));

/// Gates living in the runtime module.
pub static RUNTIME_GATES: &[GateSpec] = &[
    GateSpec::runtime("PyCFunction_Call", PY_CFUNCTION_CALL),
    GateSpec::runtime("getset_get", GETSET_GET),
    GateSpec::runtime("getset_set", GETSET_SET),
    GateSpec::runtime("type_call", TYPE_CALL).with_multiple_exits(),
    GateSpec::runtime("PyType_GenericNew", GENERIC_NEW),
    GateSpec::runtime("PyObject_Print", PRINT),
    GateSpec::runtime("PyObject_GetAttrString", GET_ATTR_STRING),
    GateSpec::runtime("PyObject_SetAttrString", SET_ATTR_STRING),
    GateSpec::runtime("PyObject_GetAttr", GET_ATTR),
    GateSpec::runtime("PyObject_SetAttr", SET_ATTR),
    GateSpec::runtime("PyObject_Repr", REPR),
    GateSpec::runtime("PyObject_Hash", HASH),
    GateSpec::runtime("PyObject_Call", CALL),
    GateSpec::runtime("PyObject_Str", STR),
    GateSpec::runtime("do_cmp", COMPARE_LEGACY)
        .with_multiple_exits()
        .until(V2_7),
    GateSpec::runtime("PyObject_RichCompare", COMPARE_LEGACY)
        .with_multiple_exits()
        .until(V2_7),
    GateSpec::runtime("do_richcompare", RICH_COMPARE)
        .with_multiple_exits()
        .since(V3_3),
    GateSpec::runtime("PyObject_GetIter", GET_ITER),
    GateSpec::runtime("PyIter_Next", ITER_NEXT),
    GateSpec::runtime("builtin_next", BUILTIN_NEXT),
];

/// Gate of the foreign function interface module, registered when that module loads.
pub static FFI_GATE: GateSpec = GateSpec {
    function: "_call_function_pointer",
    module: KnownModule::Ffi,
    multiple_exits: false,
    min_version: None,
    max_version: None,
    probes: CALL_FUNCTION_POINTER,
};

/// Runtime gates present in a runtime version.
pub fn runtime_gates(version: Option<Version>) -> impl Iterator<Item = &'static GateSpec> {
    RUNTIME_GATES
        .iter()
        .filter(move |gate| gate.applies_to(version))
}
