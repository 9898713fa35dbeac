//! Windows UI Automation (UIA) element lookup.
//!
//! Walks the accessibility tree of the desktop looking for the element that
//! best matches a `TargetDescriptor` and returns its bounding rectangle in
//! physical screen pixels. On non-Windows platforms the finder always
//! reports "not found" so the resolver falls through to AI coordinates.
use async_trait::async_trait;

use crate::accessibility::{ElementBounds, ElementFinder, TargetDescriptor};
use crate::errors::WaypostResult;

pub struct UiaElementFinder;

#[cfg(target_os = "windows")]
#[async_trait]
impl ElementFinder for UiaElementFinder {
    async fn find(&self, target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>> {
        let target = target.clone();
        // COM is not async-safe; walk the tree on a blocking thread.
        tokio::task::spawn_blocking(move || win::find_element_sync(&target))
            .await
            .map_err(|e| crate::errors::WaypostError::Accessibility(format!("join: {e}")))?
    }
}

#[cfg(not(target_os = "windows"))]
#[async_trait]
impl ElementFinder for UiaElementFinder {
    async fn find(&self, target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>> {
        tracing::debug!(target = %target.text, "accessibility tree unavailable on this platform");
        Ok(None)
    }
}

#[cfg(target_os = "windows")]
mod win {
    use super::*;
    use crate::errors::WaypostError;
    use windows::Win32::Foundation::RECT;
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
    };
    use windows::Win32::UI::Accessibility::{
        CUIAutomation, IUIAutomation, IUIAutomationElement, IUIAutomationTreeWalker,
        UIA_CONTROLTYPE_ID,
    };

    /// RAII guard for COM initialization on the current thread.
    struct ComGuard;
    impl ComGuard {
        fn new() -> Result<Self, WaypostError> {
            unsafe {
                CoInitializeEx(None, COINIT_MULTITHREADED)
                    .ok()
                    .map_err(|e| WaypostError::Accessibility(format!("CoInitializeEx: {e}")))?;
            }
            Ok(Self)
        }
    }
    impl Drop for ComGuard {
        fn drop(&mut self) {
            unsafe { CoUninitialize() };
        }
    }

    const MAX_DEPTH: u32 = 7;
    const MAX_VISITED: usize = 2_000;

    struct Candidate {
        bounds: ElementBounds,
        score: u32,
    }

    /// Walks the accessibility tree and returns the bounding box of the best
    /// match for `target`, or `None`. Must run on a blocking thread.
    pub fn find_element_sync(target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>> {
        let _com = ComGuard::new()?;

        let automation: IUIAutomation = unsafe {
            CoCreateInstance(&CUIAutomation, None, CLSCTX_ALL)
                .map_err(|e| WaypostError::Accessibility(format!("CoCreateInstance UIA: {e}")))?
        };

        let root = unsafe {
            automation
                .GetRootElement()
                .map_err(|e| WaypostError::Accessibility(format!("GetRootElement: {e}")))?
        };

        let walker = unsafe {
            automation
                .ControlViewWalker()
                .map_err(|e| WaypostError::Accessibility(format!("ControlViewWalker: {e}")))?
        };

        let wanted_type = target.kind.as_deref().and_then(kind_to_control_type);
        let mut best: Option<Candidate> = None;
        let mut visited = 0usize;

        walk_tree(
            &walker,
            &root,
            target,
            wanted_type,
            None, // nearest named ancestor
            0,
            &mut visited,
            &mut best,
        );

        tracing::debug!(
            target = %target.text,
            visited,
            found = best.is_some(),
            "UIA lookup complete"
        );
        Ok(best.map(|c| c.bounds))
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_tree(
        walker: &IUIAutomationTreeWalker,
        element: &IUIAutomationElement,
        target: &TargetDescriptor,
        wanted_type: Option<i32>,
        ancestor_name: Option<&str>,
        depth: u32,
        visited: &mut usize,
        best: &mut Option<Candidate>,
    ) {
        if depth > MAX_DEPTH || *visited >= MAX_VISITED {
            return;
        }
        *visited += 1;

        // Extract properties; inaccessible elements are skipped, not fatal.
        let name = unsafe { element.CurrentName().unwrap_or_default().to_string() };
        let offscreen = unsafe { element.CurrentIsOffscreen().unwrap_or_default().as_bool() };

        if !offscreen && !name.is_empty() {
            if let Some(score) = match_score(&name, target, wanted_type, ancestor_name, element) {
                let better = best.as_ref().map(|b| score > b.score).unwrap_or(true);
                if better {
                    if let Some(bounds) = element_bounds(element) {
                        *best = Some(Candidate { bounds, score });
                    }
                }
            }
        }

        // Children inherit the nearest named ancestor for context matching.
        let child_ancestor = if name.is_empty() {
            ancestor_name
        } else {
            Some(name.as_str())
        };

        let child = unsafe { walker.GetFirstChildElement(element) };
        let Ok(mut child) = child else { return };

        loop {
            walk_tree(
                walker,
                &child,
                target,
                wanted_type,
                child_ancestor,
                depth + 1,
                visited,
                best,
            );
            match unsafe { walker.GetNextSiblingElement(&child) } {
                Ok(next) => child = next,
                Err(_) => break,
            }
        }
    }

    /// Scores an element against the descriptor. `None` means no match.
    /// Exact name match beats substring match; kind and context hints add
    /// tie-breaking weight on top.
    fn match_score(
        name: &str,
        target: &TargetDescriptor,
        wanted_type: Option<i32>,
        ancestor_name: Option<&str>,
        element: &IUIAutomationElement,
    ) -> Option<u32> {
        let name_lc = name.to_lowercase();
        let text_lc = target.text.to_lowercase();

        let mut score = if name_lc == text_lc {
            4
        } else if name_lc.contains(&text_lc) {
            1
        } else {
            return None;
        };

        if let Some(wanted) = wanted_type {
            let ct = unsafe {
                element
                    .CurrentControlType()
                    .unwrap_or(UIA_CONTROLTYPE_ID(0))
            };
            if ct.0 == wanted {
                score += 2;
            }
        }

        if let (Some(ctx), Some(ancestor)) = (target.context.as_deref(), ancestor_name) {
            if ancestor.to_lowercase().contains(&ctx.to_lowercase()) {
                score += 1;
            }
        }

        Some(score)
    }

    fn element_bounds(element: &IUIAutomationElement) -> Option<ElementBounds> {
        let rect: RECT = unsafe { element.CurrentBoundingRectangle().ok()? };
        let width = (rect.right - rect.left) as f64;
        let height = (rect.bottom - rect.top) as f64;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(ElementBounds {
            x: rect.left as f64,
            y: rect.top as f64,
            width,
            height,
        })
    }

    /// UIA_*ControlTypeId values for the descriptor kinds the parser emits.
    fn kind_to_control_type(kind: &str) -> Option<i32> {
        match kind.to_lowercase().as_str() {
            "button" => Some(50000),
            "checkbox" => Some(50002),
            "combobox" | "select" | "dropdown" => Some(50003),
            "input" | "edit" | "textfield" => Some(50004),
            "link" => Some(50005),
            "menu" => Some(50009),
            "menuitem" => Some(50011),
            "radio" => Some(50013),
            "tab" => Some(50019),
            "text" | "label" => Some(50020),
            "window" => Some(50032),
            _ => None,
        }
    }
}
