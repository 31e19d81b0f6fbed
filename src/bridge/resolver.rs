//! Debug offsets header address discovery.
//!
//! Strategies are tried in a fixed order and the first one producing an address wins. A failed
//! strategy is logged and skipped, only exhaustion of the whole chain is reported.

use crate::bridge::address::RelocatedAddress;
use crate::bridge::error::Error;
use crate::bridge::host::{ModuleInstance, ResolverHost};
use crate::bridge::pe::RemoteImage;
use crate::config::ResolverConfig;
use crate::{pb_debug, pb_info, verbose};

/// One way to locate the debug offsets header.
pub trait ResolveStrategy {
    fn name(&self) -> &'static str;

    /// Address of the header, `Ok(None)` if this strategy has nothing to offer.
    fn resolve(
        &self,
        host: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error>;
}

/// Look up the header variable in loaded debug symbols.
pub struct SymbolLookup {
    symbol: String,
}

impl ResolveStrategy for SymbolLookup {
    fn name(&self) -> &'static str {
        "symbol lookup"
    }

    fn resolve(
        &self,
        host: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error> {
        if !host.has_symbols(module) {
            return Err(Error::NoSymbols(module.name.clone()));
        }
        let Some(rva) = host.static_variable(module, &self.symbol) else {
            return Ok(None);
        };
        // symbols of another build may point anywhere
        Ok(rva
            .relocate(module.base)
            .filter(|addr| !addr.is_null() && module.contains(*addr)))
    }
}

/// Find the runtime data section by its tag, asking the host first and walking the remote image
/// header if the host doesn't know the image layout.
pub struct SectionScan {
    tag: String,
}

impl ResolveStrategy for SectionScan {
    fn name(&self) -> &'static str {
        "section scan"
    }

    fn resolve(
        &self,
        host: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error> {
        let rva = match host.section_rva(module, &self.tag) {
            Some(rva) => Some(rva),
            None => RemoteImage::new(host, module.base).find_section(&self.tag)?,
        };
        Ok(rva.and_then(|rva| rva.relocate(module.base)))
    }
}

/// Resolve the header variable through the module export directory.
pub struct ExportLookup {
    symbol: String,
}

impl ResolveStrategy for ExportLookup {
    fn name(&self) -> &'static str {
        "export lookup"
    }

    fn resolve(
        &self,
        host: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error> {
        let rva = match host.export_rva(module, &self.symbol) {
            Some(rva) => Some(rva),
            None => RemoteImage::new(host, module.base).find_export(&self.symbol)?,
        };
        Ok(rva.and_then(|rva| rva.relocate(module.base)))
    }
}

/// Take the header variable address with a native expression in the first live thread.
pub struct LiveEvaluation {
    symbol: String,
}

impl ResolveStrategy for LiveEvaluation {
    fn name(&self) -> &'static str {
        "live evaluation"
    }

    fn resolve(
        &self,
        host: &dyn ResolverHost,
        _module: &ModuleInstance,
    ) -> Result<Option<RelocatedAddress>, Error> {
        let thread = *host.thread_ids().first().ok_or(Error::NoLiveThread)?;
        let frame = host.top_frame(thread).ok_or(Error::NoLiveThread)?;
        let value = host.evaluate_u64(thread, &frame, &format!("&::{}", self.symbol))?;
        Ok(Some(RelocatedAddress::from(value)).filter(|addr| !addr.is_null()))
    }
}

/// Ordered chain of [`ResolveStrategy`].
pub struct AddressResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl AddressResolver {
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// Symbol lookup, section scan, export lookup then live evaluation.
    pub fn with_default_chain(config: &ResolverConfig) -> Self {
        Self::new(vec![
            Box::new(SymbolLookup {
                symbol: config.symbol.clone(),
            }),
            Box::new(SectionScan {
                tag: config.section_tag.clone(),
            }),
            Box::new(ExportLookup {
                symbol: config.symbol.clone(),
            }),
            Box::new(LiveEvaluation {
                symbol: config.symbol.clone(),
            }),
        ])
    }

    /// Return the debug offsets header address, `None` if every strategy failed.
    pub fn resolve(
        &self,
        host: &dyn ResolverHost,
        module: &ModuleInstance,
    ) -> Option<RelocatedAddress> {
        for strategy in &self.strategies {
            match strategy.resolve(host, module) {
                Ok(Some(addr)) => {
                    pb_info!("debug offsets found at {addr} by {}", strategy.name());
                    return Some(addr);
                }
                Ok(None) => {
                    verbose!("{}: debug offsets not found", strategy.name());
                }
                Err(e) => {
                    pb_debug!("{}: {e:#}", strategy.name());
                }
            }
        }
        None
    }
}
