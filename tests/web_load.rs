#![cfg(all(target_arch = "wasm32", feature = "web"))]

use live_fragment::{load::load_child_nodes, Document};
use std::sync::Once;
use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
use web_sys::window;

wasm_bindgen_test_configure!(run_in_browser);

static LOG: Once = Once::new();

#[wasm_bindgen_test]
fn loads_prerendered_content() {
	LOG.call_once(tracing_wasm::set_as_global_default);

	let source = window().unwrap().document().unwrap().create_element("div").unwrap();
	source.set_inner_html(r#"<p id="a" data-magic="m1-f">hi<!--c--></p>text"#);

	let mut document = Document::new();
	let container = document.create_element("div", vec![]);
	load_child_nodes(&mut document, container, &source);

	assert_eq!(
		document.inner_markup(container),
		r#"<p id="a" data-magic="m1-f">hi<!--c--></p>text"#
	);
}
