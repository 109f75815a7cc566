use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Directive, Field, Type, TypeDefinition, TypeExtension, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::{CompositionError, SubgraphConfig, SubgraphSchema};

const FEDERATION_TYPES: &[&str] = &["_Service", "_Entity", "_Any", "_FieldSet", "FieldSet"];
const FEDERATION_ROOT_FIELDS: &[&str] = &["_service", "_entities"];
const BUILTIN_SCALARS: &[&str] = &["String", "Int", "Float", "Boolean", "ID"];

pub const QUERY_TYPE: &str = "Query";
pub const MUTATION_TYPE: &str = "Mutation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input object",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, TypeKind::Interface | TypeKind::Union)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    /// Rendered type, e.g. `[User!]!`.
    pub type_repr: String,
    pub named_type: String,
    pub owner: String,
    /// Every subgraph able to resolve the field, owner first.
    pub resolvers: Vec<String>,
}

impl FieldInfo {
    pub fn resolvable_by(&self, subgraph: &str) -> bool {
        self.resolvers.iter().any(|s| s == subgraph)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeInfo {
    pub name: String,
    pub kind: TypeKind,
    /// Resolvable `@key` fields per subgraph.
    pub keys: BTreeMap<String, Vec<String>>,
    pub fields: HashMap<String, FieldInfo>,
    /// Union members or interface implementors.
    pub possible_types: BTreeSet<String>,
    pub subgraphs: Vec<String>,
    pub is_entity: bool,
}

impl TypeInfo {
    fn new(name: &str, kind: TypeKind) -> Self {
        TypeInfo {
            name: name.to_string(),
            kind,
            keys: BTreeMap::new(),
            fields: HashMap::new(),
            possible_types: BTreeSet::new(),
            subgraphs: Vec::new(),
            is_entity: false,
        }
    }
}

/// The composed schema. Built once and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct Supergraph {
    pub subgraphs: Vec<SubgraphConfig>,
    pub types: HashMap<String, TypeInfo>,
}

impl Supergraph {
    pub fn subgraph(&self, name: &str) -> Option<&SubgraphConfig> {
        self.subgraphs.iter().find(|s| s.name == name)
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldInfo> {
        self.types.get(type_name).and_then(|t| t.fields.get(field))
    }

    pub fn has_mutations(&self) -> bool {
        self.types
            .get(MUTATION_TYPE)
            .is_some_and(|t| !t.fields.is_empty())
    }

    pub fn is_composite(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|t| t.kind.is_composite())
    }

    pub fn is_abstract(&self, type_name: &str) -> bool {
        self.types.get(type_name).is_some_and(|t| t.kind.is_abstract())
    }

    /// Whether an object typed `concrete` satisfies a fragment on `condition`.
    pub fn satisfies(&self, concrete: &str, condition: &str) -> bool {
        if concrete == condition {
            return true;
        }
        self.types
            .get(condition)
            .is_some_and(|t| t.possible_types.contains(concrete))
    }
}

#[derive(Debug, Default)]
struct RawField {
    type_repr: String,
    named_type: String,
    shareable: bool,
    external: bool,
}

#[derive(Debug)]
struct RawType {
    kind: TypeKind,
    key_fields: Vec<String>,
    resolvable_key: bool,
    is_entity: bool,
    shareable: bool,
    fields: Vec<(String, RawField)>,
    possible_types: Vec<String>,
    interfaces: Vec<String>,
}

impl RawType {
    fn new(kind: TypeKind) -> Self {
        RawType {
            kind,
            key_fields: Vec::new(),
            resolvable_key: false,
            is_entity: false,
            shareable: false,
            fields: Vec::new(),
            possible_types: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}

/// Composes subgraph schemas into a supergraph. Pure: no I/O.
pub fn compose(subgraphs: &[SubgraphSchema]) -> Result<Supergraph, CompositionError> {
    if subgraphs.is_empty() {
        return Err(CompositionError::EmptySupergraph(
            "no subgraphs configured".to_string(),
        ));
    }

    let mut types: HashMap<String, TypeInfo> = HashMap::new();
    let mut first_definer: HashMap<String, String> = HashMap::new();
    // type -> field -> [(subgraph, definition)]
    let mut field_defs: HashMap<String, BTreeMap<String, Vec<(String, RawField)>>> = HashMap::new();
    // type -> subgraph -> flat key fields (including non-resolvable keys)
    let mut declared_keys: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
    let mut implementors: Vec<(String, String)> = Vec::new();

    for subgraph in subgraphs {
        let name = &subgraph.config.name;
        let raw_types = parse_subgraph(subgraph)?;

        for (type_name, raw) in raw_types {
            let info = types
                .entry(type_name.clone())
                .or_insert_with(|| TypeInfo::new(&type_name, raw.kind));

            if info.kind != raw.kind {
                return Err(CompositionError::KindMismatch {
                    type_name,
                    first: info.kind.as_str(),
                    first_subgraph: first_definer
                        .get(&info.name)
                        .cloned()
                        .unwrap_or_default(),
                    second: raw.kind.as_str(),
                    second_subgraph: name.clone(),
                });
            }
            first_definer
                .entry(type_name.clone())
                .or_insert_with(|| name.clone());

            info.subgraphs.push(name.clone());
            info.possible_types.extend(raw.possible_types.iter().cloned());
            info.is_entity |= raw.is_entity;
            if raw.is_entity {
                if raw.resolvable_key {
                    info.keys.insert(name.clone(), raw.key_fields.clone());
                }
                declared_keys
                    .entry(type_name.clone())
                    .or_default()
                    .insert(name.clone(), raw.key_fields.clone());
            }
            for interface in &raw.interfaces {
                implementors.push((interface.clone(), type_name.clone()));
            }

            let defs = field_defs.entry(type_name.clone()).or_default();
            for (field_name, mut field) in raw.fields {
                field.shareable |= raw.shareable;
                defs.entry(field_name)
                    .or_default()
                    .push((name.clone(), field));
            }
        }
    }

    for (interface, object) in implementors {
        if let Some(info) = types.get_mut(&interface) {
            info.possible_types.insert(object);
        }
    }

    for (type_name, fields) in field_defs {
        let is_root = type_name == QUERY_TYPE || type_name == MUTATION_TYPE;
        let keys_by_subgraph = declared_keys.get(&type_name);
        let Some(info) = types.get_mut(&type_name) else {
            continue;
        };
        let exclusive_ownership = is_root || info.is_entity;

        for (field_name, defs) in fields {
            let (first_subgraph, first_def) = &defs[0];
            for (subgraph, def) in &defs[1..] {
                if def.type_repr != first_def.type_repr {
                    return Err(CompositionError::FieldTypeMismatch {
                        type_name: type_name.clone(),
                        field: field_name.clone(),
                        first: first_def.type_repr.clone(),
                        first_subgraph: first_subgraph.clone(),
                        second: def.type_repr.clone(),
                        second_subgraph: subgraph.clone(),
                    });
                }
            }

            let candidates: Vec<&(String, RawField)> =
                defs.iter().filter(|(_, def)| !def.external).collect();
            if candidates.is_empty() {
                return Err(CompositionError::UnresolvableField {
                    type_name: type_name.clone(),
                    field: field_name.clone(),
                    subgraph: first_subgraph.clone(),
                });
            }

            let is_key_in = |subgraph: &str| {
                keys_by_subgraph
                    .and_then(|keys| keys.get(subgraph))
                    .is_some_and(|keys| keys.contains(&field_name))
            };

            if exclusive_ownership && candidates.len() > 1 {
                let exclusive = candidates
                    .iter()
                    .any(|(subgraph, def)| !def.shareable && !is_key_in(subgraph.as_str()));
                if exclusive {
                    return Err(CompositionError::FieldConflict {
                        type_name: type_name.clone(),
                        field: field_name.clone(),
                        subgraphs: candidates.iter().map(|(s, _)| s.clone()).collect(),
                    });
                }
            }

            // An @external key field can still be returned by the subgraph
            // that declares the key.
            let mut resolvers: Vec<String> = candidates.iter().map(|(s, _)| s.clone()).collect();
            for (subgraph, def) in &defs {
                if def.external && is_key_in(subgraph.as_str()) && !resolvers.contains(subgraph) {
                    resolvers.push(subgraph.clone());
                }
            }
            info.fields.insert(
                field_name.clone(),
                FieldInfo {
                    name: field_name,
                    type_repr: candidates[0].1.type_repr.clone(),
                    named_type: candidates[0].1.named_type.clone(),
                    owner: resolvers[0].clone(),
                    resolvers,
                },
            );
        }
    }

    let supergraph = Supergraph {
        subgraphs: subgraphs.iter().map(|s| s.config.clone()).collect(),
        types,
    };

    validate_reachability(&supergraph)?;

    if supergraph
        .get_type(QUERY_TYPE)
        .is_none_or(|t| t.fields.is_empty())
    {
        return Err(CompositionError::EmptySupergraph(
            "no subgraph defines Query fields".to_string(),
        ));
    }

    info!(
        subgraphs = supergraph.subgraphs.len(),
        types = supergraph.types.len(),
        "composed supergraph"
    );
    Ok(supergraph)
}

/// Every field on a shared object type must be reachable from each subgraph
/// that can return that type, either directly or through an entity fetch.
fn validate_reachability(supergraph: &Supergraph) -> Result<(), CompositionError> {
    let mut type_names: Vec<&String> = supergraph.types.keys().collect();
    type_names.sort();

    for type_name in type_names {
        let info = &supergraph.types[type_name];
        if info.kind != TypeKind::Object
            || info.subgraphs.len() < 2
            || type_name == QUERY_TYPE
            || type_name == MUTATION_TYPE
        {
            continue;
        }

        let mut field_names: Vec<&String> = info.fields.keys().collect();
        field_names.sort();

        for field_name in field_names {
            let field = &info.fields[field_name];
            for subgraph in &info.subgraphs {
                if field.resolvable_by(subgraph) {
                    continue;
                }

                let reachable = info.keys.get(&field.owner).is_some_and(|key_fields| {
                    key_fields.iter().all(|key| {
                        info.fields
                            .get(key)
                            .is_some_and(|k| k.resolvable_by(subgraph))
                    })
                });
                if !reachable {
                    return Err(CompositionError::UnresolvableField {
                        type_name: type_name.clone(),
                        field: field_name.clone(),
                        subgraph: field.owner.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn parse_subgraph(subgraph: &SubgraphSchema) -> Result<Vec<(String, RawType)>, CompositionError> {
    let name = &subgraph.config.name;
    let sdl = strip_schema_extensions(&subgraph.sdl);
    let document = parse_schema::<String>(&sdl).map_err(|e| CompositionError::InvalidSchema {
        subgraph: name.clone(),
        reason: e.to_string(),
    })?;

    let mut root_names: HashMap<String, String> = HashMap::new();
    for definition in &document.definitions {
        if let Definition::SchemaDefinition(schema) = definition {
            if let Some(query) = &schema.query {
                root_names.insert(query.clone(), QUERY_TYPE.to_string());
            }
            if let Some(mutation) = &schema.mutation {
                root_names.insert(mutation.clone(), MUTATION_TYPE.to_string());
            }
        }
    }
    let canonical = |type_name: &str| {
        root_names
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| type_name.to_string())
    };

    let mut order: Vec<String> = Vec::new();
    let mut raw_types: HashMap<String, RawType> = HashMap::new();

    for definition in &document.definitions {
        let (type_name, kind, directives, fields, members, interfaces) = match definition {
            Definition::TypeDefinition(typedef) => match typedef {
                TypeDefinition::Object(obj) => (
                    &obj.name,
                    TypeKind::Object,
                    &obj.directives,
                    Some(&obj.fields),
                    None,
                    Some(&obj.implements_interfaces),
                ),
                TypeDefinition::Interface(iface) => (
                    &iface.name,
                    TypeKind::Interface,
                    &iface.directives,
                    Some(&iface.fields),
                    None,
                    None,
                ),
                TypeDefinition::Union(union_type) => (
                    &union_type.name,
                    TypeKind::Union,
                    &union_type.directives,
                    None,
                    Some(&union_type.types),
                    None,
                ),
                TypeDefinition::Enum(enum_type) => (
                    &enum_type.name,
                    TypeKind::Enum,
                    &enum_type.directives,
                    None,
                    None,
                    None,
                ),
                TypeDefinition::Scalar(scalar) => (
                    &scalar.name,
                    TypeKind::Scalar,
                    &scalar.directives,
                    None,
                    None,
                    None,
                ),
                TypeDefinition::InputObject(input) => (
                    &input.name,
                    TypeKind::InputObject,
                    &input.directives,
                    None,
                    None,
                    None,
                ),
            },
            Definition::TypeExtension(extension) => match extension {
                TypeExtension::Object(obj) => (
                    &obj.name,
                    TypeKind::Object,
                    &obj.directives,
                    Some(&obj.fields),
                    None,
                    Some(&obj.implements_interfaces),
                ),
                TypeExtension::Interface(iface) => (
                    &iface.name,
                    TypeKind::Interface,
                    &iface.directives,
                    Some(&iface.fields),
                    None,
                    None,
                ),
                TypeExtension::Union(union_type) => (
                    &union_type.name,
                    TypeKind::Union,
                    &union_type.directives,
                    None,
                    Some(&union_type.types),
                    None,
                ),
                TypeExtension::Enum(enum_type) => (
                    &enum_type.name,
                    TypeKind::Enum,
                    &enum_type.directives,
                    None,
                    None,
                    None,
                ),
                TypeExtension::Scalar(scalar) => (
                    &scalar.name,
                    TypeKind::Scalar,
                    &scalar.directives,
                    None,
                    None,
                    None,
                ),
                TypeExtension::InputObject(input) => (
                    &input.name,
                    TypeKind::InputObject,
                    &input.directives,
                    None,
                    None,
                    None,
                ),
            },
            _ => continue,
        };

        if is_federation_type(type_name) {
            continue;
        }

        let type_name = canonical(type_name);
        let is_root = type_name == QUERY_TYPE || type_name == MUTATION_TYPE;
        let raw = raw_entry(&mut raw_types, &mut order, name, &type_name, kind)?;

        for key in directives.iter().filter(|d| d.name == "key") {
            let Some(fields) = string_argument(key, "fields") else {
                continue;
            };
            if fields.contains('{') {
                return Err(CompositionError::UnsupportedKey {
                    type_name,
                    fields,
                    subgraph: name.clone(),
                });
            }
            raw.is_entity = true;
            if bool_argument(key, "resolvable") != Some(false) {
                raw.resolvable_key = true;
            }
            for key_field in fields
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|f| !f.is_empty())
            {
                if !raw.key_fields.iter().any(|k| k == key_field) {
                    raw.key_fields.push(key_field.to_string());
                }
            }
        }
        raw.shareable |= has_directive(directives, "shareable");

        if let Some(members) = members {
            raw.possible_types.extend(members.iter().cloned());
        }
        if let Some(interfaces) = interfaces {
            raw.interfaces.extend(interfaces.iter().cloned());
        }
        if let Some(fields) = fields {
            for field in fields {
                if is_root && FEDERATION_ROOT_FIELDS.contains(&field.name.as_str()) {
                    continue;
                }
                raw.fields.push((field.name.clone(), raw_field(field, &canonical)));
            }
        }
    }

    let mut parsed = Vec::with_capacity(order.len());
    for type_name in order {
        if let Some(raw) = raw_types.remove(&type_name) {
            for key in &raw.key_fields {
                if !raw.fields.iter().any(|(f, _)| f == key) {
                    return Err(CompositionError::InvalidSchema {
                        subgraph: name.clone(),
                        reason: format!(
                            "@key field \"{}\" is not defined on type \"{}\"",
                            key, type_name
                        ),
                    });
                }
            }
            parsed.push((type_name, raw));
        }
    }

    debug!(subgraph = %name, types = parsed.len(), "parsed subgraph schema");
    Ok(parsed)
}

fn raw_entry<'a>(
    raw_types: &'a mut HashMap<String, RawType>,
    order: &mut Vec<String>,
    subgraph: &str,
    type_name: &str,
    kind: TypeKind,
) -> Result<&'a mut RawType, CompositionError> {
    if !raw_types.contains_key(type_name) {
        order.push(type_name.to_string());
    }
    let raw = raw_types
        .entry(type_name.to_string())
        .or_insert_with(|| RawType::new(kind));
    if raw.kind != kind {
        return Err(CompositionError::InvalidSchema {
            subgraph: subgraph.to_string(),
            reason: format!("type \"{}\" is declared with conflicting kinds", type_name),
        });
    }
    Ok(raw)
}

fn raw_field(field: &Field<'_, String>, canonical: &impl Fn(&str) -> String) -> RawField {
    RawField {
        type_repr: field.field_type.to_string(),
        named_type: canonical(named_type(&field.field_type)),
        shareable: has_directive(&field.directives, "shareable"),
        external: has_directive(&field.directives, "external"),
    }
}

pub(crate) fn named_type<'a>(field_type: &'a Type<'_, String>) -> &'a str {
    match field_type {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

fn is_federation_type(name: &str) -> bool {
    FEDERATION_TYPES.contains(&name)
        || name.starts_with("link__")
        || name.starts_with("federation__")
}

pub fn is_builtin_scalar(name: &str) -> bool {
    BUILTIN_SCALARS.contains(&name)
}

fn has_directive(directives: &[Directive<'_, String>], name: &str) -> bool {
    directives.iter().any(|d| d.name == name)
}

fn string_argument(directive: &Directive<'_, String>, name: &str) -> Option<String> {
    directive.arguments.iter().find_map(|(k, v)| match v {
        Value::String(s) if k == name => Some(s.clone()),
        _ => None,
    })
}

fn bool_argument(directive: &Directive<'_, String>, name: &str) -> Option<bool> {
    directive.arguments.iter().find_map(|(k, v)| match v {
        Value::Boolean(b) if k == name => Some(*b),
        _ => None,
    })
}

/// Removes `extend schema ...` blocks (federation 2 `@link` imports), which
/// carry nothing composition needs.
pub(crate) fn strip_schema_extensions(sdl: &str) -> String {
    let mut output = String::with_capacity(sdl.len());
    let mut rest = sdl;

    while let Some(start) = find_keyword(rest, "extend schema") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + "extend schema".len()..];
        let consumed = skip_schema_extension_body(tail);
        rest = &tail[consumed..];
    }
    output.push_str(rest);
    output
}

/// Byte offset of `keyword` outside strings, block strings and comments.
fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];
        if rest.starts_with(b"\"\"\"") {
            i += 3;
            while i < bytes.len() && !bytes[i..].starts_with(b"\"\"\"") {
                i += if bytes[i..].starts_with(b"\\\"\"\"") { 4 } else { 1 };
            }
            i += 3;
            continue;
        }

        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            _ if rest.starts_with(keyword.as_bytes())
                && (i == 0 || bytes[i - 1].is_ascii_whitespace()) =>
            {
                return Some(i);
            }
            _ => i += 1,
        }
    }
    None
}

fn skip_schema_extension_body(tail: &str) -> usize {
    let bytes = tail.as_bytes();
    let mut i = 0;

    let skip_ws = |mut i: usize| {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        i
    };

    loop {
        let next = skip_ws(i);
        match bytes.get(next) {
            Some(b'@') => {
                i = next + 1;
                while i < bytes.len() && ((bytes[i] as char).is_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let after_name = skip_ws(i);
                if bytes.get(after_name) == Some(&b'(') {
                    i = skip_balanced(bytes, after_name, b'(', b')');
                }
            }
            Some(b'{') => return skip_balanced(bytes, next, b'{', b'}'),
            _ => return i,
        }
    }
}

fn skip_balanced(bytes: &[u8], start: usize, open: u8, close: u8) -> usize {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = start;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if c == b'\\' {
                i += 1;
            } else if c == b'"' {
                in_string = false;
            }
        } else if c == b'"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return i + 1;
            }
        }
        i += 1;
    }
    bytes.len()
}
