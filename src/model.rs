//! Intra-package symbol model.
//!
//! The engine runs over tree-sitter parse trees, which carry no type
//! information, so this module reconstructs the small slice of it the
//! analysis needs: which functions and methods the package declares, what
//! named type each receiver, parameter, and simple local is bound to, what
//! types struct fields have, and which identifiers name imported packages.
//!
//! Resolution is deliberately conservative. A call whose receiver type
//! cannot be determined resolves to nothing and the caller skips it; an
//! expression whose type is unknown is *assumed* to be a mutex when tested,
//! so unusual code shapes degrade to over-approximation, never to a crash.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use tree_sitter::Node;

use crate::fqn::Fqn;
use crate::package::Package;
use crate::syntax;

/// Method receiver: `w` bound to type `wrapper` for `func (w *wrapper) ...`.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub name: String,
    /// Receiver type with one level of pointer indirection stripped.
    pub type_name: String,
}

/// A declared parameter, in declaration order.
#[derive(Debug, Clone)]
pub struct Param {
    /// Empty for unnamed parameters (they still occupy an index).
    pub name: String,
    /// Rendered type text, e.g. `bool`, `*Queue`, `map[string]string`.
    pub type_name: String,
}

/// A function or method declaration with a body.
pub struct FuncDecl<'p> {
    pub fqn: Fqn,
    pub name: String,
    pub receiver: Option<Receiver>,
    pub params: Vec<Param>,
    pub body: Node<'p>,
    /// Index of the declaring file within the package.
    pub file: usize,
    /// Identifier-to-named-type bindings visible in the body (receiver,
    /// parameters, simple locals). Pointer indirection stripped.
    bindings: FxHashMap<String, String>,
}

impl FuncDecl<'_> {
    /// Boolean parameters by name, mapped to their parameter index.
    #[must_use]
    pub fn bool_params(&self) -> FxHashMap<&str, usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.type_name == "bool" && !p.name.is_empty())
            .map(|(i, p)| (p.name.as_str(), i))
            .collect()
    }
}

/// Symbol model of one package.
pub struct Model<'p> {
    pkg_path: String,
    pub funcs: Vec<FuncDecl<'p>>,
    sources: Vec<&'p [u8]>,
    /// Per-file import name to import path.
    imports: Vec<FxHashMap<String, String>>,
    /// Struct type name to field name to rendered field type.
    structs: FxHashMap<String, FxHashMap<String, String>>,
    free_funcs: FxHashSet<String>,
}

impl<'p> Model<'p> {
    /// Build the model by scanning every file of the package.
    #[must_use]
    pub fn build(pkg: &'p Package) -> Model<'p> {
        let mut model = Model {
            pkg_path: pkg.import_path.clone(),
            funcs: Vec::new(),
            sources: pkg.files.iter().map(|f| f.source.as_slice()).collect(),
            imports: vec![FxHashMap::default(); pkg.files.len()],
            structs: FxHashMap::default(),
            free_funcs: FxHashSet::default(),
        };

        for (file_index, file) in pkg.files.iter().enumerate() {
            let source = file.source.as_slice();
            let root = file.root();
            let mut cursor = root.walk();
            for decl in root.named_children(&mut cursor) {
                match decl.kind() {
                    "import_declaration" => model.scan_imports(file_index, decl, source),
                    "type_declaration" => model.scan_types(decl, source),
                    "function_declaration" | "method_declaration" => {
                        model.scan_func(file_index, decl, source);
                    }
                    _ => {}
                }
            }
        }

        debug!(
            package = %model.pkg_path,
            functions = model.funcs.len(),
            structs = model.structs.len(),
            "built symbol model"
        );
        model
    }

    /// Source bytes of a file by index.
    #[must_use]
    pub fn source(&self, file: usize) -> &'p [u8] {
        self.sources[file]
    }

    /// Static type of an expression, as a rendered type name, resolving
    /// identifier bindings and struct field selector chains.
    #[must_use]
    pub fn type_of(&self, func: &FuncDecl<'p>, expr: Node<'p>) -> Option<String> {
        let source = self.source(func.file);
        match expr.kind() {
            "identifier" => func.bindings.get(syntax::text(expr, source)).cloned(),
            "parenthesized_expression" => self.type_of(func, expr.named_child(0)?),
            "selector_expression" => {
                let operand = expr.child_by_field_name("operand")?;
                let field = expr.child_by_field_name("field")?;
                let base = self.type_of(func, operand)?;
                let fields = self.structs.get(base.trim_start_matches('*'))?;
                fields.get(syntax::text(field, source)).cloned()
            }
            _ => None,
        }
    }

    /// Whether the expression's static type (peeling one pointer) is
    /// `sync.Mutex` or `sync.RWMutex`. True when the type is unknown.
    #[must_use]
    pub fn is_mutex(&self, func: &FuncDecl<'p>, expr: Node<'p>) -> bool {
        match self.type_of(func, expr) {
            None => true,
            Some(t) => {
                let t = t.trim_start_matches('*');
                t == "sync.Mutex" || t == "sync.RWMutex"
            }
        }
    }

    /// Resolve a call expression to the fully qualified name it invokes.
    ///
    /// Free function calls resolve within the package; method calls resolve
    /// through the receiver's bound type; calls through an imported package
    /// name resolve to `<import-path>.<name>`. Anything else (chained calls,
    /// unknown receivers, methods on foreign types) resolves to `None`.
    #[must_use]
    pub fn resolve_call(&self, func: &FuncDecl<'p>, call: Node<'p>) -> Option<Fqn> {
        let source = self.source(func.file);
        let callee = call.child_by_field_name("function")?;
        match callee.kind() {
            "identifier" => {
                let name = syntax::text(callee, source);
                self.free_funcs
                    .contains(name)
                    .then(|| Fqn::function(&self.pkg_path, name))
            }
            "selector_expression" => {
                let operand = callee.child_by_field_name("operand")?;
                let method = syntax::text(callee.child_by_field_name("field")?, source);

                if operand.kind() == "identifier" {
                    let base = syntax::text(operand, source);
                    if !func.bindings.contains_key(base) {
                        if let Some(path) = self.imports[func.file].get(base) {
                            return Some(Fqn::function(path, method));
                        }
                    }
                }

                let recv_type = self.type_of(func, operand)?;
                let recv_type = recv_type.trim_start_matches('*');
                // Methods on foreign (package-qualified) types are outside
                // the intra-package call graph.
                if recv_type.contains('.') {
                    return None;
                }
                Some(Fqn::method(&self.pkg_path, recv_type, method))
            }
            _ => None,
        }
    }

    fn scan_imports(&mut self, file: usize, decl: Node<'p>, source: &[u8]) {
        let mut specs = Vec::new();
        let mut cursor = decl.walk();
        for child in decl.named_children(&mut cursor) {
            match child.kind() {
                "import_spec" => specs.push(child),
                "import_spec_list" => {
                    let mut inner = child.walk();
                    specs.extend(
                        child
                            .named_children(&mut inner)
                            .filter(|c| c.kind() == "import_spec"),
                    );
                }
                _ => {}
            }
        }

        for spec in specs {
            let Some(path_node) = spec.child_by_field_name("path") else {
                continue;
            };
            let path = syntax::text(path_node, source).trim_matches('"').to_string();
            let name = match spec.child_by_field_name("name") {
                Some(n) => {
                    let name = syntax::text(n, source);
                    if name == "_" || name == "." {
                        continue;
                    }
                    name.to_string()
                }
                None => path.rsplit('/').next().unwrap_or(&path).to_string(),
            };
            self.imports[file].insert(name, path);
        }
    }

    fn scan_types(&mut self, decl: Node<'p>, source: &[u8]) {
        let mut cursor = decl.walk();
        for spec in decl.named_children(&mut cursor) {
            if spec.kind() != "type_spec" {
                continue;
            }
            let Some(name) = spec.child_by_field_name("name") else {
                continue;
            };
            let Some(ty) = spec.child_by_field_name("type") else {
                continue;
            };
            if ty.kind() != "struct_type" {
                continue;
            }

            let mut fields = FxHashMap::default();
            let Some(list) = ty.named_child(0) else {
                continue;
            };
            let mut field_cursor = list.walk();
            for field in list.named_children(&mut field_cursor) {
                if field.kind() != "field_declaration" {
                    continue;
                }
                let Some(field_type) = field.child_by_field_name("type") else {
                    continue;
                };
                let type_text = syntax::render(field_type, source);
                for (child, field_name) in field_children(field) {
                    if field_name == Some("name") {
                        fields.insert(syntax::render(child, source), type_text.clone());
                    }
                }
            }
            self.structs
                .insert(syntax::render(name, source), fields);
        }
    }

    fn scan_func(&mut self, file: usize, decl: Node<'p>, source: &[u8]) {
        let Some(body) = decl.child_by_field_name("body") else {
            return;
        };
        let Some(name_node) = decl.child_by_field_name("name") else {
            return;
        };
        let name = syntax::render(name_node, source);

        let receiver = decl
            .child_by_field_name("receiver")
            .and_then(|r| extract_receiver(r, source));
        let params = decl
            .child_by_field_name("parameters")
            .map(|p| extract_params(p, source))
            .unwrap_or_default();

        let fqn = match &receiver {
            Some(recv) => Fqn::method(&self.pkg_path, &recv.type_name, &name),
            None => {
                self.free_funcs.insert(name.clone());
                Fqn::function(&self.pkg_path, &name)
            }
        };

        let mut bindings = FxHashMap::default();
        if let Some(recv) = &receiver {
            bindings.insert(recv.name.clone(), recv.type_name.clone());
        }
        for param in &params {
            if !param.name.is_empty() {
                bindings.insert(
                    param.name.clone(),
                    param.type_name.trim_start_matches('*').to_string(),
                );
            }
        }
        collect_local_bindings(body, source, &mut bindings);

        self.funcs.push(FuncDecl {
            fqn,
            name,
            receiver,
            params,
            body,
            file,
            bindings,
        });
    }
}

/// Iterate a node's children together with their field names.
fn field_children(node: Node) -> Vec<(Node, Option<&'static str>)> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    if cursor.goto_first_child() {
        loop {
            let child = cursor.node();
            if child.is_named() {
                out.push((child, cursor.field_name()));
            }
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }
    out
}

/// Receiver name and type from a method's receiver parameter list.
fn extract_receiver(receiver_list: Node, source: &[u8]) -> Option<Receiver> {
    let mut cursor = receiver_list.walk();
    let decl = receiver_list
        .named_children(&mut cursor)
        .find(|c| c.kind() == "parameter_declaration")?;

    let mut name = String::new();
    for (child, field) in field_children(decl) {
        if field == Some("name") {
            name = syntax::render(child, source);
        }
    }
    let type_node = decl.child_by_field_name("type")?;
    let type_name = syntax::text(type_node, source)
        .trim_start_matches('*')
        .to_string();
    if type_name.is_empty() {
        return None;
    }
    Some(Receiver { name, type_name })
}

/// Flatten a parameter list into one [`Param`] per declared name, in order.
/// An unnamed parameter contributes one entry with an empty name.
fn extract_params(param_list: Node, source: &[u8]) -> Vec<Param> {
    let mut params = Vec::new();
    let mut cursor = param_list.walk();
    for decl in param_list.named_children(&mut cursor) {
        if decl.kind() != "parameter_declaration"
            && decl.kind() != "variadic_parameter_declaration"
        {
            continue;
        }
        let type_name = decl
            .child_by_field_name("type")
            .map(|t| syntax::render(t, source))
            .unwrap_or_default();

        let names: Vec<String> = field_children(decl)
            .into_iter()
            .filter(|(_, f)| *f == Some("name"))
            .map(|(n, _)| syntax::render(n, source))
            .collect();

        if names.is_empty() {
            params.push(Param {
                name: String::new(),
                type_name,
            });
        } else {
            for name in names {
                params.push(Param {
                    name,
                    type_name: type_name.clone(),
                });
            }
        }
    }
    params
}

/// Collect simple local bindings: `x := T{...}`, `x := &T{...}`, and
/// `var x T`. Closure bodies are skipped; their locals are out of scope for
/// the enclosing function.
fn collect_local_bindings(node: Node, source: &[u8], bindings: &mut FxHashMap<String, String>) {
    match node.kind() {
        "func_literal" => return,
        "short_var_declaration" => {
            if let (Some(left), Some(right)) = (
                node.child_by_field_name("left"),
                node.child_by_field_name("right"),
            ) {
                if left.named_child_count() == 1 && right.named_child_count() == 1 {
                    let lhs = left.named_child(0);
                    let rhs = right.named_child(0);
                    if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
                        if lhs.kind() == "identifier" {
                            if let Some(ty) = composite_type(rhs, source) {
                                bindings
                                    .entry(syntax::render(lhs, source))
                                    .or_insert(ty);
                            }
                        }
                    }
                }
            }
        }
        "var_spec" => {
            if let Some(ty) = node.child_by_field_name("type") {
                let type_name = syntax::text(ty, source)
                    .trim_start_matches('*')
                    .to_string();
                for (child, field) in field_children(node) {
                    if field == Some("name") {
                        bindings
                            .entry(syntax::render(child, source))
                            .or_insert_with(|| type_name.clone());
                    }
                }
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_local_bindings(child, source, bindings);
    }
}

/// Type name of a composite literal expression, through one `&`.
fn composite_type(expr: Node, source: &[u8]) -> Option<String> {
    let literal = match expr.kind() {
        "composite_literal" => expr,
        "unary_expression" => {
            let operand = expr.child_by_field_name("operand")?;
            if operand.kind() != "composite_literal" {
                return None;
            }
            operand
        }
        _ => return None,
    };
    let ty = literal.child_by_field_name("type")?;
    if ty.kind() != "type_identifier" && ty.kind() != "qualified_type" {
        return None;
    }
    Some(syntax::render(ty, source))
}
