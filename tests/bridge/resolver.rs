use crate::common::{Debugee, Header, HEADER_RVA, RUNTIME_BASE};
use pybridge::bridge::address::RelocatedAddress;
use pybridge::bridge::error::Error;
use pybridge::bridge::host::{FrameContext, ModuleInstance, ResolverHost};
use pybridge::bridge::resolver::{AddressResolver, ResolveStrategy};
use pybridge::bridge::ProcessContext;
use pybridge::config::{BridgeConfig, ResolverConfig};
use std::cell::RefCell;
use std::rc::Rc;

enum Answer {
    Nothing,
    Fail,
    Found(u64),
}

struct Recorded {
    name: &'static str,
    answer: Answer,
    calls: Rc<RefCell<Vec<&'static str>>>,
}

impl ResolveStrategy for Recorded {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve(
        &self,
        _: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error> {
        self.calls.borrow_mut().push(self.name);
        match self.answer {
            Answer::Nothing => Ok(None),
            Answer::Fail => Err(Error::NoSymbols(module.name.clone())),
            Answer::Found(addr) => Ok(Some(RelocatedAddress::from(addr))),
        }
    }
}

fn chain(answers: [Answer; 4], calls: &Rc<RefCell<Vec<&'static str>>>) -> AddressResolver {
    let names = ["symbol", "section", "export", "live"];
    AddressResolver::new(
        names
            .into_iter()
            .zip(answers)
            .map(|(name, answer)| {
                Box::new(Recorded {
                    name,
                    answer,
                    calls: calls.clone(),
                }) as Box<dyn ResolveStrategy>
            })
            .collect(),
    )
}

#[test]
fn test_strategies_order() {
    struct TestCase {
        answers: [Answer; 4],
        expected_calls: Vec<&'static str>,
        expected: Option<u64>,
    }
    let test_cases = [
        TestCase {
            answers: [Answer::Fail, Answer::Nothing, Answer::Fail, Answer::Found(0x10)],
            expected_calls: vec!["symbol", "section", "export", "live"],
            expected: Some(0x10),
        },
        TestCase {
            answers: [
                Answer::Nothing,
                Answer::Found(0x20),
                Answer::Found(0x30),
                Answer::Found(0x40),
            ],
            expected_calls: vec!["symbol", "section"],
            expected: Some(0x20),
        },
        TestCase {
            answers: [Answer::Fail, Answer::Fail, Answer::Nothing, Answer::Nothing],
            expected_calls: vec!["symbol", "section", "export", "live"],
            expected: None,
        },
    ];

    let debugee = Debugee::new(Header::default());
    for tc in test_cases {
        let calls = Rc::new(RefCell::new(vec![]));
        let resolver = chain(tc.answers, &calls);
        let found = resolver.resolve(&debugee, &Debugee::runtime());
        assert_eq!(found.map(|a| a.as_u64()), tc.expected);
        assert_eq!(*calls.borrow(), tc.expected_calls);
    }
}

#[test]
fn test_default_chain_symbol_lookup() {
    let debugee = Debugee::new(Header::default());
    let resolver = AddressResolver::with_default_chain(&ResolverConfig::default());
    assert_eq!(
        resolver.resolve(&debugee, &Debugee::runtime()),
        Some(RelocatedAddress::from(RUNTIME_BASE + HEADER_RVA))
    );
}

#[test]
fn test_default_chain_symbol_out_of_module() {
    let mut debugee = Debugee::new(Header::default());
    // symbols of another build
    debugee
        .variables
        .insert("_Py_DebugOffsets".to_string(), 0x4000_0000);
    let resolver = AddressResolver::with_default_chain(&ResolverConfig::default());
    assert_eq!(resolver.resolve(&debugee, &Debugee::runtime()), None);
}

#[test]
fn test_default_chain_live_evaluation() {
    let mut debugee = Debugee::new(Header::default());
    debugee.has_symbols = false;
    debugee.top = Some(FrameContext::default());
    debugee
        .expressions
        .insert("&::_Py_DebugOffsets".to_string(), RUNTIME_BASE + HEADER_RVA);

    let mut ctx = ProcessContext::new(BridgeConfig::default(), Debugee::runtime());
    let offsets = ctx.ensure_offsets(&debugee).unwrap();
    assert_eq!(offsets.script_path_size, 260);
}
