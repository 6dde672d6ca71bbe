//! Rewrites fixed-binding shader source into explicit-binding source.
//!
//! Plain uniforms are collected into one generated uniform block per stage,
//! injected before the first function definition, and later references are
//! rewritten to block-qualified accesses. Samplers, images, and storage
//! blocks receive binding placeholders that are filled in at link time.
//! Varyings get sequential locations in declaration order.

use std::collections::HashSet;

use super::layout::{round_up, Field, FieldType, LayoutEngine, UniformType};
use super::lexer::{self, Token, TokenKind};
use super::preprocess::{self, Definitions};
use super::{ResourceKind, ShaderResource, ShaderSource, ShaderStage, Varying, BLOCK_PLACEHOLDER};
use crate::error::{RenderError, RenderResult};

/// GLSL version every rewritten stage is compiled as.
pub const TARGET_VERSION: &str = "#version 450";

const QUALIFIERS: &[&str] = &[
    "uniform",
    "buffer",
    "in",
    "out",
    "inout",
    "flat",
    "smooth",
    "noperspective",
    "centroid",
    "invariant",
    "highp",
    "mediump",
    "lowp",
    "readonly",
    "writeonly",
    "coherent",
    "volatile",
    "restrict",
];

/// Layout qualifiers assigned by the engine. Author-supplied values are dropped.
const ENGINE_ASSIGNED: &[&str] = &["binding", "set"];

fn resource_kind(type_name: &str) -> Option<ResourceKind> {
    let opaque = |name: &str| name.starts_with("sampler") || name.starts_with("image");
    let base = ['i', 'u']
        .iter()
        .find_map(|prefix| type_name.strip_prefix(*prefix).filter(|rest| opaque(rest)))
        .unwrap_or(type_name);
    if base.starts_with("sampler") {
        Some(ResourceKind::Sampler)
    } else if base.starts_with("image") {
        Some(ResourceKind::StorageImage)
    } else {
        None
    }
}

/// Locations consumed by one varying of `type_name`.
fn location_slots(type_name: &str) -> u32 {
    let name = type_name.strip_prefix('d').unwrap_or(type_name);
    match name.strip_prefix("mat") {
        Some(dims) => dims
            .chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .unwrap_or(1),
        None => 1,
    }
}

/// Transpile one stage. Conditional compilation is resolved with the
/// caller's `definitions` spliced in.
pub fn transpile(name: &str, stage: ShaderStage, source: &str, definitions: &str) -> RenderResult<ShaderSource> {
    let pre = preprocess::preprocess(source, definitions);
    for warning in &pre.warnings {
        log::warn!("{}: {}", name, warning);
    }

    let tokens = lexer::tokenize(&pre.text);
    let mut transpiler = Transpiler {
        name,
        stage,
        definitions: &pre.definitions,
        layout: LayoutEngine::new(),
        out: String::with_capacity(pre.text.len() + 512),
        injection: None,
        saw_version: false,
        block_fields: Vec::new(),
        blockified: HashSet::new(),
        resources: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        next_input: 0,
        next_output: 0,
    };
    transpiler.run(&tokens)?;
    transpiler.finish(definitions)
}

struct Transpiler<'s> {
    name: &'s str,
    stage: ShaderStage,
    definitions: &'s Definitions,
    layout: LayoutEngine,
    out: String,
    /// Byte offset in `out` of the first function definition.
    injection: Option<usize>,
    saw_version: bool,
    block_fields: Vec<Field>,
    blockified: HashSet<String>,
    resources: Vec<ShaderResource>,
    inputs: Vec<Varying>,
    outputs: Vec<Varying>,
    next_input: u32,
    next_output: u32,
}

/// Leading `layout(...)` and storage qualifiers of a declaration.
struct Qualified<'a> {
    layout: Vec<String>,
    qualifiers: Vec<&'a str>,
    /// Index of the first significant token after the qualifiers.
    rest: usize,
}

impl Qualified<'_> {
    fn has(&self, qualifier: &str) -> bool {
        self.qualifiers.contains(&qualifier)
    }

    fn layout_has(&self, key: &str) -> bool {
        self.layout.iter().any(|item| layout_key(item) == key)
    }
}

struct Declarator {
    name: String,
    array: Option<String>,
}

fn layout_key(item: &str) -> &str {
    item.split('=').next().unwrap_or("").trim()
}

fn parse_qualifiers<'a>(sig: &[Token<'a>]) -> Qualified<'a> {
    let mut layout = Vec::new();
    let mut qualifiers = Vec::new();
    let mut i = 0;
    loop {
        match sig.get(i) {
            Some(t) if t.is_ident("layout") && sig.get(i + 1).is_some_and(|p| p.is_punct("(")) => {
                let mut depth = 0;
                let mut item = String::new();
                i += 1;
                while let Some(t) = sig.get(i) {
                    i += 1;
                    if t.is_punct("(") {
                        depth += 1;
                        if depth == 1 {
                            continue;
                        }
                    } else if t.is_punct(")") {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    } else if t.is_punct(",") && depth == 1 {
                        layout.push(std::mem::take(&mut item));
                        continue;
                    }
                    if !item.is_empty() && t.kind == TokenKind::Ident && !item.ends_with(['(', '=']) {
                        item.push(' ');
                    }
                    item.push_str(t.text);
                }
                if !item.is_empty() {
                    layout.push(item);
                }
            }
            Some(t) if t.kind == TokenKind::Ident && QUALIFIERS.contains(&t.text) => {
                qualifiers.push(t.text);
                i += 1;
            }
            _ => break,
        }
    }
    Qualified {
        layout,
        qualifiers,
        rest: i,
    }
}

/// Parse `type name[expr]?, name2 ... ;` starting at `start`.
fn parse_declarators<'a>(sig: &[Token<'a>], start: usize) -> Option<(&'a str, Vec<Declarator>)> {
    let type_token = sig.get(start).filter(|t| t.kind == TokenKind::Ident)?;
    let mut declarators = Vec::new();
    let mut i = start + 1;
    loop {
        let name = sig.get(i).filter(|t| t.kind == TokenKind::Ident)?;
        i += 1;
        let mut array = None;
        if sig.get(i).is_some_and(|t| t.is_punct("[")) {
            let mut expression = Vec::new();
            i += 1;
            loop {
                let t = sig.get(i)?;
                i += 1;
                if t.is_punct("]") {
                    break;
                }
                expression.push(t.text);
            }
            array = Some(expression.join(" "));
        }
        declarators.push(Declarator {
            name: name.text.to_string(),
            array,
        });
        match sig.get(i) {
            Some(t) if t.is_punct(",") => i += 1,
            Some(t) if t.is_punct(";") && i + 1 == sig.len() => break,
            _ => return None,
        }
    }
    Some((type_token.text, declarators))
}

/// End (exclusive) of the statement starting at `start`, and whether it is a
/// function definition.
fn split_statement(tokens: &[Token<'_>], start: usize) -> (usize, bool) {
    let mut parens = 0u32;
    let mut braces = 0u32;
    let mut function = false;
    let mut previous: Option<&str> = None;

    for (offset, t) in tokens[start..].iter().enumerate() {
        let at = start + offset;
        if t.kind == TokenKind::Punct {
            match t.text {
                "(" => parens += 1,
                ")" => parens = parens.saturating_sub(1),
                "{" => {
                    if braces == 0 && parens == 0 && previous == Some(")") {
                        function = true;
                    }
                    braces += 1;
                }
                "}" => {
                    braces = braces.saturating_sub(1);
                    if braces == 0 && function {
                        return (at + 1, true);
                    }
                }
                ";" if braces == 0 && parens == 0 => return (at + 1, false),
                _ => {}
            }
        }
        if !t.is_trivia() {
            previous = Some(t.text);
        }
    }
    (tokens.len(), function)
}

/// Index in `stmt` of its `n`th significant token.
fn position_of_significant(stmt: &[Token<'_>], n: usize) -> usize {
    stmt.iter()
        .enumerate()
        .filter(|(_, t)| !t.is_trivia())
        .nth(n)
        .map_or(stmt.len(), |(i, _)| i)
}

impl<'s> Transpiler<'s> {
    fn error(&self, message: impl Into<String>) -> RenderError {
        RenderError::transpile(self.name, message)
    }

    fn instance_name(&self) -> &'static str {
        match self.stage {
            ShaderStage::Vertex => "lumen_vs",
            ShaderStage::Fragment => "lumen_fs",
            ShaderStage::Compute => "lumen_cs",
        }
    }

    fn block_name(&self) -> &'static str {
        match self.stage {
            ShaderStage::Vertex => "LumenVertexUniforms",
            ShaderStage::Fragment => "LumenFragmentUniforms",
            ShaderStage::Compute => "LumenComputeUniforms",
        }
    }

    fn array_size(&self, expression: &str) -> RenderResult<u32> {
        match self.definitions.resolve_int(expression) {
            Some(size) if size > 0 && size <= u32::MAX as i64 => Ok(size as u32),
            Some(size) => Err(self.error(format!("invalid array size {} ({})", expression, size))),
            None => Err(self.error(format!("cannot resolve array size {}", expression))),
        }
    }

    fn run(&mut self, tokens: &[Token<'_>]) -> RenderResult<()> {
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            if token.is_trivia() {
                self.out.push_str(token.text);
                i += 1;
                continue;
            }
            if token.kind == TokenKind::Directive {
                if token.text.trim_start().trim_start_matches('#').trim_start().starts_with("version") {
                    self.out.push_str(TARGET_VERSION);
                    self.saw_version = true;
                } else {
                    self.out.push_str(token.text);
                }
                i += 1;
                continue;
            }

            let (end, is_function) = split_statement(tokens, i);
            let stmt = &tokens[i..end];
            i = end;

            if is_function {
                if self.injection.is_none() {
                    self.injection = Some(self.out.len());
                }
                self.emit_rewritten(stmt);
                continue;
            }

            let sig = lexer::significant(stmt);
            if sig.first().is_some_and(|t| t.is_ident("struct")) {
                self.struct_definition(stmt, &sig)?;
                continue;
            }

            let qualified = parse_qualifiers(&sig);
            let has_body = sig.iter().any(|t| t.is_punct("{"));
            if qualified.has("buffer") {
                self.storage_block(stmt, &sig, &qualified)?;
            } else if qualified.has("uniform") {
                if has_body {
                    return Err(self.error("explicit uniform blocks are not supported"));
                }
                self.uniform(&sig, &qualified)?;
            } else if (qualified.has("in") || qualified.has("out")) && !has_body && qualified.rest + 1 < sig.len() {
                self.varying(stmt, &sig, &qualified)?;
            } else {
                self.emit_rewritten(stmt);
            }
        }
        Ok(())
    }

    /// Emit tokens, qualifying references to blockified uniforms.
    fn emit_rewritten(&mut self, stmt: &[Token<'_>]) {
        let instance = self.instance_name();
        let mut previous: Option<&str> = None;
        for t in stmt {
            if t.kind == TokenKind::Ident && previous != Some(".") && self.blockified.contains(t.text) {
                self.out.push_str(instance);
                self.out.push('.');
            }
            self.out.push_str(t.text);
            if !t.is_trivia() {
                previous = Some(t.text);
            }
        }
    }

    fn struct_definition(&mut self, stmt: &[Token<'_>], sig: &[Token<'_>]) -> RenderResult<()> {
        let name = sig
            .get(1)
            .filter(|t| t.kind == TokenKind::Ident)
            .ok_or_else(|| self.error("struct without a name"))?
            .text;
        if !sig.get(2).is_some_and(|t| t.is_punct("{")) {
            // Not a definition (e.g. a declaration using `struct` keyword).
            self.emit_rewritten(stmt);
            return Ok(());
        }
        let close = sig
            .iter()
            .rposition(|t| t.is_punct("}"))
            .ok_or_else(|| self.error(format!("unterminated struct {}", name)))?;

        let mut fields = Vec::new();
        let mut member_start = 3;
        while member_start < close {
            let member_end = sig[member_start..close]
                .iter()
                .position(|t| t.is_punct(";"))
                .map(|p| member_start + p + 1)
                .ok_or_else(|| self.error(format!("malformed member in struct {}", name)))?;
            let member = &sig[member_start..member_end];
            let qualified = parse_qualifiers(member);
            let (type_name, declarators) = parse_declarators(member, qualified.rest)
                .ok_or_else(|| self.error(format!("malformed member in struct {}", name)))?;
            let ty = self.field_type(type_name)?;
            for declarator in declarators {
                let array = match &declarator.array {
                    Some(expression) => Some(self.array_size(expression)?),
                    None => None,
                };
                fields.push(Field {
                    name: declarator.name,
                    ty: ty.clone(),
                    array,
                });
            }
            member_start = member_end;
        }

        let layout = self
            .layout
            .define_struct(name, &fields)
            .map_err(|e| RenderError::transpile(self.name, e))?
            .clone();

        // Explicit padding keeps the compiled struct bit-identical to the
        // computed layout.
        let mut text = format!("struct {} {{\n", name);
        let mut cursor = 0;
        let mut pad = 0;
        let pad_to = |text: &mut String, from: u32, to: u32, pad: &mut u32| {
            let mut at = from;
            while at < to {
                text.push_str(&format!("    float _pad{};\n", pad));
                *pad += 1;
                at += 4;
            }
        };
        for placed in &layout.fields {
            pad_to(&mut text, cursor, placed.offset, &mut pad);
            let (size, _, _) = self
                .layout
                .field_size_align(&placed.field)
                .map_err(|e| RenderError::transpile(self.name, e))?;
            text.push_str(&format!("    {} {}", placed.field.ty.glsl_name(), placed.field.name));
            if let Some(count) = placed.field.array {
                text.push_str(&format!("[{}]", count));
            }
            text.push_str(";\n");
            cursor = placed.offset + size;
        }
        pad_to(&mut text, cursor, layout.size, &mut pad);
        text.push('}');

        // Declarators after the closing brace are kept as written.
        let tail = position_of_significant(stmt, close + 1);
        self.out.push_str(&text);
        self.emit_rewritten(&stmt[tail..]);
        Ok(())
    }

    fn field_type(&self, type_name: &str) -> RenderResult<FieldType> {
        if let Some(ty) = UniformType::parse(type_name) {
            Ok(FieldType::Plain(ty))
        } else if self.layout.has_struct(type_name) {
            Ok(FieldType::Struct(type_name.to_string()))
        } else {
            Err(self.error(format!("unknown uniform type {}", type_name)))
        }
    }

    fn uniform(&mut self, sig: &[Token<'_>], qualified: &Qualified<'_>) -> RenderResult<()> {
        let (type_name, declarators) = parse_declarators(sig, qualified.rest).ok_or_else(|| {
            let text: Vec<&str> = sig.iter().map(|t| t.text).collect();
            self.error(format!("malformed uniform declaration: {}", text.join(" ")))
        })?;

        if let Some(kind) = resource_kind(type_name) {
            let mut layout: Vec<String> = qualified
                .layout
                .iter()
                .filter(|item| !ENGINE_ASSIGNED.contains(&layout_key(item)))
                .cloned()
                .collect();
            layout.push("set = 0".to_string());
            let other: Vec<&str> = qualified
                .qualifiers
                .iter()
                .copied()
                .filter(|q| *q != "uniform")
                .collect();
            for (n, declarator) in declarators.iter().enumerate() {
                if declarator.array.is_some() {
                    return Err(self.error(format!("arrays of {} are not supported", type_name)));
                }
                if n > 0 {
                    self.out.push(' ');
                }
                self.out.push_str(&format!(
                    "layout({}, binding = {}) uniform {}{} {};",
                    layout.join(", "),
                    super::resource_placeholder(&declarator.name),
                    other.iter().map(|q| format!("{} ", q)).collect::<String>(),
                    type_name,
                    declarator.name
                ));
                self.add_resource(&declarator.name, kind);
            }
            return Ok(());
        }

        let ty = self.field_type(type_name)?;
        for declarator in declarators {
            if self.blockified.contains(&declarator.name) {
                return Err(self.error(format!("duplicate uniform {}", declarator.name)));
            }
            let array = match &declarator.array {
                Some(expression) => Some(self.array_size(expression)?),
                None => None,
            };
            self.blockified.insert(declarator.name.clone());
            self.block_fields.push(Field {
                name: declarator.name,
                ty: ty.clone(),
                array,
            });
        }
        Ok(())
    }

    fn add_resource(&mut self, name: &str, kind: ResourceKind) {
        if !self.resources.iter().any(|r| r.name == name) {
            self.resources.push(ShaderResource {
                name: name.to_string(),
                kind,
            });
        }
    }

    fn storage_block(&mut self, stmt: &[Token<'_>], sig: &[Token<'_>], qualified: &Qualified<'_>) -> RenderResult<()> {
        let name = sig
            .get(qualified.rest)
            .filter(|t| t.kind == TokenKind::Ident)
            .filter(|_| sig.get(qualified.rest + 1).is_some_and(|t| t.is_punct("{")))
            .ok_or_else(|| self.error("malformed storage block"))?
            .text
            .to_string();

        let mut layout: Vec<String> = qualified
            .layout
            .iter()
            .filter(|item| !ENGINE_ASSIGNED.contains(&layout_key(item)))
            .cloned()
            .collect();
        if !qualified.layout_has("std430") && !qualified.layout_has("std140") {
            layout.insert(0, "std430".to_string());
        }
        layout.push("set = 0".to_string());
        layout.push(format!("binding = {}", super::resource_placeholder(&name)));

        // Keep everything from the first storage qualifier on.
        let first_qualifier = qualified.rest - qualified.qualifiers.len();
        let start = position_of_significant(stmt, first_qualifier);
        self.out.push_str(&format!("layout({}) ", layout.join(", ")));
        for t in &stmt[start..] {
            self.out.push_str(t.text);
        }
        self.add_resource(&name, ResourceKind::StorageBuffer);
        Ok(())
    }

    fn varying(&mut self, stmt: &[Token<'_>], sig: &[Token<'_>], qualified: &Qualified<'_>) -> RenderResult<()> {
        if qualified.layout_has("location") {
            self.emit_rewritten(stmt);
            return Ok(());
        }
        let Some((type_name, declarators)) = parse_declarators(sig, qualified.rest) else {
            self.emit_rewritten(stmt);
            return Ok(());
        };
        let input = qualified.has("in");
        let qualifiers = qualified.qualifiers.join(" ");

        for (n, declarator) in declarators.into_iter().enumerate() {
            let count = match &declarator.array {
                Some(expression) => self.array_size(expression)?,
                None => 1,
            };
            let slots = location_slots(type_name) * count;
            let location = if input {
                let location = self.next_input;
                self.next_input += slots;
                location
            } else {
                let location = self.next_output;
                self.next_output += slots;
                location
            };

            let mut layout = qualified.layout.clone();
            layout.push(format!("location = {}", location));
            if n > 0 {
                self.out.push(' ');
            }
            self.out.push_str(&format!("layout({}) {} {} {}", layout.join(", "), qualifiers, type_name, declarator.name));
            if declarator.array.is_some() {
                self.out.push_str(&format!("[{}]", count));
            }
            self.out.push(';');

            let varying = Varying {
                name: declarator.name,
                location,
                flat: qualified.has("flat"),
            };
            if input {
                self.inputs.push(varying);
            } else {
                self.outputs.push(varying);
            }
        }
        Ok(())
    }

    fn block_text(&self, fields: &[(u32, &Field)]) -> String {
        let mut text = format!(
            "layout(std140, set = 0, binding = {}) uniform {} {{\n",
            BLOCK_PLACEHOLDER,
            self.block_name()
        );
        for (offset, field) in fields {
            text.push_str(&format!(
                "    layout(offset = {}) {} {}",
                offset,
                field.ty.glsl_name(),
                field.name
            ));
            if let Some(count) = field.array {
                text.push_str(&format!("[{}]", count));
            }
            text.push_str(";\n");
        }
        text.push_str(&format!("}} {};\n\n", self.instance_name()));
        text
    }

    fn finish(mut self, definitions: &str) -> RenderResult<ShaderSource> {
        let (placed, end, _) = self
            .layout
            .place(&self.block_fields)
            .map_err(|e| RenderError::transpile(self.name, e))?;

        let mut uniforms = Vec::new();
        for field in &placed {
            self.layout
                .flatten("", field, &mut uniforms)
                .map_err(|e| RenderError::transpile(self.name, e))?;
        }
        let block_size = if placed.is_empty() { 0 } else { round_up(end, 16) };

        if !placed.is_empty() {
            let fields: Vec<(u32, &Field)> = placed.iter().map(|p| (p.offset, &p.field)).collect();
            let block = self.block_text(&fields);
            let at = self.injection.unwrap_or(self.out.len());
            self.out.insert_str(at, &block);
        }
        if !self.saw_version {
            self.out.insert_str(0, &format!("{}\n", TARGET_VERSION));
        }

        log::debug!(
            "transpiled {} ({:?}): {} uniform entries, block {} bytes, {} resources",
            self.name,
            self.stage,
            uniforms.len(),
            block_size,
            self.resources.len()
        );

        Ok(ShaderSource {
            name: self.name.to_string(),
            stage: self.stage,
            definitions: definitions.to_string(),
            text: self.out,
            uniforms,
            block_size,
            resources: self.resources,
            inputs: self.inputs,
            outputs: self.outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: &str = "#version 330 core
uniform vec4 color;
uniform float scale;
uniform sampler2D tex;
in vec2 texcoord;
out vec4 fragColor;

void main() {
    // color is a tint
    fragColor = texture(tex, texcoord) * color * scale;
}
";

    fn slot<'a>(shader: &'a ShaderSource, name: &str) -> &'a super::super::layout::UniformSlot {
        shader
            .uniforms
            .iter()
            .find(|u| u.name == name)
            .unwrap_or_else(|| panic!("no uniform {}", name))
    }

    // ========================================================================
    // Block layout
    // ========================================================================

    #[test]
    fn test_plain_uniforms_become_block_members() {
        let shader = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        assert_eq!(slot(&shader, "color").offset, 0);
        assert_eq!(slot(&shader, "scale").offset, 16);
        assert_eq!(shader.block_size, 32);
        assert!(shader.text.starts_with("#version 450\n"));
        assert!(shader.text.contains("layout(offset = 16) float scale;"));
        assert!(shader.text.contains("* lumen_fs.color * lumen_fs.scale"));
        assert!(!shader.text.contains("uniform vec4 color;"));
    }

    #[test]
    fn test_block_injected_before_first_function() {
        let shader = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        let block = shader.text.find("uniform LumenFragmentUniforms").unwrap();
        let main = shader.text.find("void main").unwrap();
        let output = shader.text.find("out vec4 fragColor").unwrap();
        assert!(output < block && block < main);
    }

    #[test]
    fn test_comments_are_not_rewritten() {
        let shader = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        assert!(shader.text.contains("// color is a tint"));
    }

    #[test]
    fn test_member_access_not_rewritten() {
        let source = "uniform float scale;\nstruct S { float scale; };\nvoid main() { S s; float x = s.scale * scale; }\n";
        let shader = transpile("m.vert", ShaderStage::Vertex, source, "").unwrap();
        assert!(shader.text.contains("s.scale * lumen_vs.scale"));
    }

    #[test]
    fn test_identical_source_is_deterministic() {
        let a = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        let b = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_array_size_from_definition() {
        let source = "#define MAX_LIGHTS 4\nuniform vec4 lights[MAX_LIGHTS];\nuniform float count;\nvoid main() {}\n";
        let shader = transpile("l.frag", ShaderStage::Fragment, source, "").unwrap();
        assert_eq!(slot(&shader, "lights").count, 4);
        assert_eq!(slot(&shader, "lights[3]").offset, 48);
        assert_eq!(slot(&shader, "count").offset, 64);
        assert!(shader.text.contains("vec4 lights[4];"));
    }

    #[test]
    fn test_struct_uniform_is_padded_and_flattened() {
        let source = "struct Light {\n    vec3 position;\n    vec2 range;\n};\nuniform Light light;\nuniform float gain;\nvoid main() {}\n";
        let shader = transpile("s.frag", ShaderStage::Fragment, source, "").unwrap();
        assert_eq!(slot(&shader, "light.position").offset, 0);
        assert_eq!(slot(&shader, "light.range").offset, 16);
        assert_eq!(slot(&shader, "gain").offset, 32);
        // vec3 ends at 12, vec2 sits at 16: one float of padding.
        assert!(shader.text.contains("vec3 position;\n    float _pad0;\n    vec2 range;"));
    }

    #[test]
    fn test_conditional_uniforms() {
        let source = "#if defined(SKINNED)\nuniform mat4 bones[2];\n#else\nuniform mat4 model;\n#endif\nvoid main() {}\n";
        let skinned = transpile("c.vert", ShaderStage::Vertex, source, "#define SKINNED").unwrap();
        assert!(skinned.uniforms.iter().any(|u| u.name == "bones[1]"));
        let plain = transpile("c.vert", ShaderStage::Vertex, source, "").unwrap();
        assert_eq!(plain.uniforms.len(), 1);
        assert_eq!(plain.uniforms[0].name, "model");
    }

    // ========================================================================
    // Resources and varyings
    // ========================================================================

    #[test]
    fn test_opaque_uniforms_get_placeholders() {
        let shader = transpile("test.frag", ShaderStage::Fragment, FRAGMENT, "").unwrap();
        assert_eq!(shader.resources.len(), 1);
        assert_eq!(shader.resources[0].kind, ResourceKind::Sampler);
        assert!(shader
            .text
            .contains("layout(set = 0, binding = @res:tex@) uniform sampler2D tex;"));
    }

    #[test]
    fn test_storage_block_and_image() {
        let source = "layout(local_size_x = 64) in;\n\
                      layout(std430, binding = 3) readonly buffer Bones { mat4 bones[]; };\n\
                      buffer Vertices { vec4 positions[]; } verts;\n\
                      layout(rgba8) uniform writeonly image2D target;\n\
                      void main() {}\n";
        let shader = transpile("skin.comp", ShaderStage::Compute, source, "").unwrap();
        let names: Vec<&str> = shader.resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Bones", "Vertices", "target"]);
        assert!(shader.text.contains("layout(local_size_x = 64) in;"));
        assert!(shader
            .text
            .contains("layout(std430, set = 0, binding = @res:Bones@) readonly buffer Bones"));
        assert!(shader
            .text
            .contains("layout(std430, set = 0, binding = @res:Vertices@) buffer Vertices"));
        assert!(shader
            .text
            .contains("layout(rgba8, set = 0, binding = @res:target@) uniform writeonly image2D target;"));
    }

    #[test]
    fn test_varyings_get_sequential_locations() {
        let source = "in vec3 position;\nin mat4 instance;\nin vec4 tint;\nflat out int index;\nout vec2 uv;\nvoid main() {}\n";
        let shader = transpile("v.vert", ShaderStage::Vertex, source, "").unwrap();
        let locations: Vec<u32> = shader.inputs.iter().map(|v| v.location).collect();
        assert_eq!(locations, vec![0, 1, 5]);
        assert_eq!(shader.outputs[0].location, 0);
        assert!(shader.outputs[0].flat);
        assert_eq!(shader.outputs[1].location, 1);
        assert!(shader.text.contains("layout(location = 5) in vec4 tint;"));
        assert!(shader.text.contains("layout(location = 0) flat out int index;"));
    }

    // ========================================================================
    // Errors
    // ========================================================================

    #[test]
    fn test_unknown_uniform_type_fails() {
        let err = transpile("bad.frag", ShaderStage::Fragment, "uniform dvec4 x;\nvoid main() {}\n", "").unwrap_err();
        assert!(matches!(err, RenderError::ShaderTranspile { .. }));
        assert!(err.to_string().contains("dvec4"));
    }

    #[test]
    fn test_unresolvable_array_size_fails() {
        let source = "uniform vec4 lights[MAX_LIGHTS + ];\nvoid main() {}\n";
        assert!(transpile("bad.frag", ShaderStage::Fragment, source, "").is_err());
    }

    #[test]
    fn test_duplicate_uniform_fails() {
        let source = "uniform float a;\nuniform vec2 a;\nvoid main() {}\n";
        assert!(transpile("dup.frag", ShaderStage::Fragment, source, "").is_err());
    }

    #[test]
    fn test_definitions_spliced() {
        let source = "#version 330\n{$DEFINITIONS}\n#ifdef FOG\nuniform float density;\n#endif\nvoid main() {}\n";
        let shader = transpile("f.frag", ShaderStage::Fragment, source, "#define FOG\n").unwrap();
        assert_eq!(shader.definitions, "#define FOG\n");
        assert!(shader.uniforms.iter().any(|u| u.name == "density"));
        assert!(shader.text.starts_with("#version 450\n#define FOG\n"));
    }
}
