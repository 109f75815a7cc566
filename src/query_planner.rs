use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, OperationDefinition, Selection,
    SelectionSet, TypeCondition, Value, VariableDefinition, parse_query,
};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::supergraph::{MUTATION_TYPE, QUERY_TYPE, is_builtin_scalar};
use crate::{GraphQLRequest, RequestError, Supergraph};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }

    pub fn root_type(&self) -> &'static str {
        match self {
            OperationKind::Query => QUERY_TYPE,
            OperationKind::Mutation => MUTATION_TYPE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldNode {
    pub alias: Option<String>,
    pub name: String,
    /// Arguments rendered back to GraphQL text.
    pub arguments: Vec<(String, String)>,
    /// Directives forwarded to subgraphs (`@skip`/`@include` are evaluated here).
    pub directives: Vec<String>,
    pub variables: BTreeSet<String>,
    pub selections: Vec<SelectionNode>,
}

impl FieldNode {
    pub fn leaf(name: &str) -> Self {
        FieldNode {
            alias: None,
            name: name.to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            variables: BTreeSet::new(),
            selections: Vec::new(),
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectionNode {
    Field(FieldNode),
    InlineFragment {
        type_condition: Option<String>,
        selections: Vec<SelectionNode>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDef {
    pub name: String,
    /// `$name: Type = default`
    pub rendered: String,
}

/// The validated client operation with fragments expanded.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDef>,
    pub selections: Vec<SelectionNode>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchKind {
    /// Fetches root fields; `response_keys` are the top-level keys it answers.
    Root { response_keys: Vec<String> },
    /// Resolves entities found at `path` through `_entities`.
    Entity {
        type_name: String,
        key_fields: Vec<String>,
        path: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchNode {
    pub service: String,
    pub operation: String,
    pub operation_name: Option<String>,
    /// Client variables forwarded with this fetch.
    pub variables: Vec<String>,
    pub kind: FetchKind,
    /// Fetches that need this fetch's data first.
    pub dependents: Vec<FetchNode>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub operation: Operation,
    pub fetches: Vec<FetchNode>,
}

impl QueryPlan {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    /// Total number of fetches, dependents included.
    pub fn fetch_count(&self) -> usize {
        fn count(nodes: &[FetchNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.dependents)).sum()
        }
        count(&self.fetches)
    }
}

pub trait QueryPlanner: Send + Sync {
    fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &Supergraph,
    ) -> Result<QueryPlan, RequestError>;
}

#[derive(Clone, Debug, Default)]
pub struct SimpleQueryPlanner;

impl SimpleQueryPlanner {
    pub fn new() -> Self {
        SimpleQueryPlanner
    }
}

impl QueryPlanner for SimpleQueryPlanner {
    fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &Supergraph,
    ) -> Result<QueryPlan, RequestError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| RequestError::Parse(e.to_string()))?;
        let variables = request.variables_map();

        let operation = build_operation(
            schema,
            &document,
            request.operation_name.as_deref(),
            &variables,
        )?;
        let fetches = plan_fetches(schema, &operation)?;

        debug!(
            operation = ?operation.name,
            fetches = fetches.len(),
            "planned operation"
        );
        Ok(QueryPlan { operation, fetches })
    }
}

fn build_operation(
    schema: &Supergraph,
    document: &Document<'_, String>,
    operation_name: Option<&str>,
    variables: &Map<String, JsonValue>,
) -> Result<Operation, RequestError> {
    let mut operations = Vec::new();
    let mut fragments = HashMap::new();

    for definition in &document.definitions {
        match definition {
            Definition::Operation(op) => operations.push(op),
            Definition::Fragment(fragment) => {
                if fragments.insert(fragment.name.clone(), fragment).is_some() {
                    return Err(RequestError::Validation(format!(
                        "There can be only one fragment named \"{}\".",
                        fragment.name
                    )));
                }
            }
        }
    }

    let selected = match operation_name {
        Some(wanted) => operations
            .iter()
            .find(|op| operation_name_of(op) == Some(wanted))
            .ok_or_else(|| {
                RequestError::Validation(format!("Unknown operation named \"{}\".", wanted))
            })?,
        None => match operations.as_slice() {
            [single] => single,
            [] => {
                return Err(RequestError::Validation(
                    "Document does not contain any operation.".to_string(),
                ));
            }
            _ => {
                return Err(RequestError::Validation(
                    "Must provide operation name if query contains multiple operations."
                        .to_string(),
                ));
            }
        },
    };

    let (kind, name, variable_definitions, directives, selection_set) = match selected {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, None, None, set),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name.clone(),
            Some(&q.variable_definitions),
            Some(&q.directives),
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name.clone(),
            Some(&m.variable_definitions),
            Some(&m.directives),
            &m.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            return Err(RequestError::Validation(
                "Subscriptions are not supported by this gateway.".to_string(),
            ));
        }
    };

    if directives.is_some_and(|d| !d.is_empty()) {
        return Err(RequestError::Validation(
            "Operation directives are not supported.".to_string(),
        ));
    }
    if kind == OperationKind::Mutation && !schema.has_mutations() {
        return Err(RequestError::Validation(
            "Schema is not configured for mutations.".to_string(),
        ));
    }

    let definitions: &[VariableDefinition<'_, String>] =
        variable_definitions.map(|v| v.as_slice()).unwrap_or(&[]);
    let mut defaults = HashMap::new();
    let mut rendered_definitions = Vec::with_capacity(definitions.len());
    for definition in definitions {
        if let Some(Value::Boolean(b)) = &definition.default_value {
            defaults.insert(definition.name.clone(), *b);
        }
        let mut rendered = format!("${}: {}", definition.name, definition.var_type);
        if let Some(default) = &definition.default_value {
            rendered.push_str(&format!(" = {}", default));
        }
        rendered_definitions.push(VariableDef {
            name: definition.name.clone(),
            rendered,
        });
    }

    let mut converter = Converter {
        schema,
        fragments,
        variables,
        defaults,
        declared: rendered_definitions.iter().map(|d| d.name.clone()).collect(),
        stack: Vec::new(),
    };
    let selections = converter.convert_selection_set(selection_set, kind.root_type())?;

    Ok(Operation {
        kind,
        name,
        variable_definitions: rendered_definitions,
        selections,
    })
}

fn operation_name_of<'q>(op: &'q OperationDefinition<'_, String>) -> Option<&'q str> {
    match op {
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
        OperationDefinition::SelectionSet(_) => None,
    }
}

/// Turns the parsed operation into the owned selection tree, validating it
/// against the supergraph on the way.
struct Converter<'p, 'q> {
    schema: &'p Supergraph,
    fragments: HashMap<String, &'p FragmentDefinition<'q, String>>,
    variables: &'p Map<String, JsonValue>,
    defaults: HashMap<String, bool>,
    declared: BTreeSet<String>,
    stack: Vec<String>,
}

impl<'p, 'q> Converter<'p, 'q> {
    fn convert_selection_set(
        &mut self,
        set: &SelectionSet<'q, String>,
        parent_type: &str,
    ) -> Result<Vec<SelectionNode>, RequestError> {
        let mut nodes = Vec::with_capacity(set.items.len());

        for item in &set.items {
            match item {
                Selection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    nodes.push(SelectionNode::Field(self.convert_field(field, parent_type)?));
                }
                Selection::InlineFragment(fragment) => {
                    if !self.included(&fragment.directives)? {
                        continue;
                    }
                    let type_condition = match &fragment.type_condition {
                        Some(TypeCondition::On(name)) => {
                            self.check_type_condition(name)?;
                            Some(name.clone())
                        }
                        None => None,
                    };
                    let scope = type_condition.as_deref().unwrap_or(parent_type).to_string();
                    let selections = self.convert_selection_set(&fragment.selection_set, &scope)?;
                    nodes.push(SelectionNode::InlineFragment {
                        type_condition,
                        selections,
                    });
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let name = &spread.fragment_name;
                    let Some(fragment) = self.fragments.get(name).copied() else {
                        return Err(RequestError::Validation(format!(
                            "Unknown fragment \"{}\".",
                            name
                        )));
                    };
                    if self.stack.contains(name) {
                        return Err(RequestError::Validation(format!(
                            "Cannot spread fragment \"{}\" within itself.",
                            name
                        )));
                    }
                    let TypeCondition::On(type_condition) = &fragment.type_condition;
                    self.check_type_condition(type_condition)?;

                    self.stack.push(name.clone());
                    let selections =
                        self.convert_selection_set(&fragment.selection_set, type_condition)?;
                    self.stack.pop();

                    nodes.push(SelectionNode::InlineFragment {
                        type_condition: Some(type_condition.clone()),
                        selections,
                    });
                }
            }
        }

        Ok(nodes)
    }

    fn convert_field(
        &mut self,
        field: &Field<'q, String>,
        parent_type: &str,
    ) -> Result<FieldNode, RequestError> {
        let mut node = FieldNode {
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: Vec::with_capacity(field.arguments.len()),
            directives: Vec::new(),
            variables: BTreeSet::new(),
            selections: Vec::new(),
        };

        for (name, value) in &field.arguments {
            collect_value_variables(value, &mut node.variables);
            node.arguments.push((name.clone(), value.to_string()));
        }
        for directive in &field.directives {
            if directive.name == "skip" || directive.name == "include" {
                continue;
            }
            for (_, value) in &directive.arguments {
                collect_value_variables(value, &mut node.variables);
            }
            node.directives.push(render_directive(directive));
        }
        for variable in &node.variables {
            if !self.declared.contains(variable) {
                return Err(RequestError::Validation(format!(
                    "Variable \"${}\" is not defined.",
                    variable
                )));
            }
        }

        if field.name == "__typename" {
            if !field.selection_set.items.is_empty() {
                return Err(RequestError::Validation(
                    "Field \"__typename\" must not have a selection since type \"String!\" has no subfields."
                        .to_string(),
                ));
            }
            return Ok(node);
        }
        if field.name.starts_with("__") {
            return Err(RequestError::Validation(format!(
                "Introspection field \"{}\" is not supported by this gateway.",
                field.name
            )));
        }

        let Some(info) = self.schema.field(parent_type, &field.name) else {
            return Err(RequestError::Validation(format!(
                "Cannot query field \"{}\" on type \"{}\".",
                field.name, parent_type
            )));
        };
        let named_type = info.named_type.clone();
        let type_repr = info.type_repr.clone();

        if self.schema.is_composite(&named_type) {
            if field.selection_set.items.is_empty() {
                return Err(RequestError::Validation(format!(
                    "Field \"{}\" of type \"{}\" must have a selection of subfields.",
                    field.name, type_repr
                )));
            }
            node.selections = self.convert_selection_set(&field.selection_set, &named_type)?;
        } else if !field.selection_set.items.is_empty() {
            return Err(RequestError::Validation(format!(
                "Field \"{}\" must not have a selection since type \"{}\" has no subfields.",
                field.name, type_repr
            )));
        }

        Ok(node)
    }

    fn check_type_condition(&self, name: &str) -> Result<(), RequestError> {
        if self.schema.is_composite(name) {
            Ok(())
        } else if self.schema.get_type(name).is_some() || is_builtin_scalar(name) {
            Err(RequestError::Validation(format!(
                "Fragment cannot condition on non composite type \"{}\".",
                name
            )))
        } else {
            Err(RequestError::Validation(format!("Unknown type \"{}\".", name)))
        }
    }

    /// Evaluates `@skip` and `@include`.
    fn included(&self, directives: &[Directive<'q, String>]) -> Result<bool, RequestError> {
        for directive in directives {
            let expected = match directive.name.as_str() {
                "skip" => false,
                "include" => true,
                _ => continue,
            };
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| value)
                .ok_or_else(|| {
                    RequestError::Validation(format!(
                        "Directive \"@{}\" argument \"if\" of type \"Boolean!\" is required.",
                        directive.name
                    ))
                })?;
            let value = match condition {
                Value::Boolean(b) => *b,
                Value::Variable(name) => self
                    .variables
                    .get(name)
                    .and_then(JsonValue::as_bool)
                    .or_else(|| self.defaults.get(name).copied())
                    .ok_or_else(|| {
                        RequestError::Validation(format!(
                            "Variable \"${}\" of type \"Boolean!\" was not provided.",
                            name
                        ))
                    })?,
                other => {
                    return Err(RequestError::Validation(format!(
                        "Argument \"if\" has invalid value {}.",
                        other
                    )));
                }
            };
            if value != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn collect_value_variables(value: &Value<'_, String>, out: &mut BTreeSet<String>) {
    match value {
        Value::Variable(name) => {
            out.insert(name.clone());
        }
        Value::List(items) => items.iter().for_each(|v| collect_value_variables(v, out)),
        Value::Object(fields) => fields.values().for_each(|v| collect_value_variables(v, out)),
        _ => {}
    }
}

fn render_directive(directive: &Directive<'_, String>) -> String {
    if directive.arguments.is_empty() {
        return format!("@{}", directive.name);
    }
    let arguments: Vec<String> = directive
        .arguments
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect();
    format!("@{}({})", directive.name, arguments.join(", "))
}

fn plan_fetches(schema: &Supergraph, operation: &Operation) -> Result<Vec<FetchNode>, RequestError> {
    let root_type = operation.kind.root_type();
    let mut root_fields = Vec::new();
    flatten_fields(schema, root_type, &operation.selections, &mut root_fields);

    // Groups keep document order; mutations only merge consecutive fields.
    let mut groups: Vec<(String, Vec<SelectionNode>)> = Vec::new();
    for field in root_fields {
        if field.name == "__typename" {
            continue;
        }
        let owner = schema
            .field(root_type, &field.name)
            .map(|f| f.owner.clone())
            .ok_or_else(|| {
                RequestError::Validation(format!(
                    "Cannot query field \"{}\" on type \"{}\".",
                    field.name, root_type
                ))
            })?;

        let existing = match operation.kind {
            OperationKind::Query => groups.iter_mut().find(|(service, _)| *service == owner),
            OperationKind::Mutation => groups.last_mut().filter(|(service, _)| *service == owner),
        };
        match existing {
            Some((_, fields)) => fields.push(SelectionNode::Field(field.clone())),
            None => groups.push((owner, vec![SelectionNode::Field(field.clone())])),
        }
    }

    let splitter = Splitter { schema, operation };
    let mut fetches = Vec::with_capacity(groups.len());
    for (index, (service, fields)) in groups.into_iter().enumerate() {
        let response_keys = fields
            .iter()
            .filter_map(|node| match node {
                SelectionNode::Field(f) => Some(f.response_key().to_string()),
                SelectionNode::InlineFragment { .. } => None,
            })
            .fold(Vec::new(), |mut keys, key| {
                if !keys.contains(&key) {
                    keys.push(key);
                }
                keys
            });

        let (selections, dependents) = splitter.split(&service, root_type, &fields, &[])?;
        let variables = used_variables(&selections);
        let operation_name = operation
            .name
            .as_ref()
            .map(|name| format!("{}__{}__{}", name, sanitize_name(&service), index));

        let mut text = String::from(operation.kind.keyword());
        if let Some(name) = &operation_name {
            text.push(' ');
            text.push_str(name);
        }
        let definitions = splitter.variable_definitions(&variables);
        if !definitions.is_empty() {
            text.push_str(&format!("({})", definitions.join(", ")));
        }
        text.push(' ');
        render_selection_set(&selections, &mut text);

        fetches.push(FetchNode {
            service,
            operation: text,
            operation_name,
            variables: variables.into_iter().collect(),
            kind: FetchKind::Root { response_keys },
            dependents,
        });
    }

    Ok(fetches)
}

/// Collects the fields that apply to an object of `parent_type`, looking
/// through inline fragments whose condition it satisfies.
fn flatten_fields<'n>(
    schema: &Supergraph,
    parent_type: &str,
    selections: &'n [SelectionNode],
    out: &mut Vec<&'n FieldNode>,
) {
    for selection in selections {
        match selection {
            SelectionNode::Field(field) => out.push(field),
            SelectionNode::InlineFragment {
                type_condition,
                selections,
            } => {
                let applies = type_condition
                    .as_deref()
                    .is_none_or(|condition| schema.satisfies(parent_type, condition));
                if applies {
                    flatten_fields(schema, parent_type, selections, out);
                }
            }
        }
    }
}

/// Response names the gateway injects must not be taken by an alias of a
/// different field.
fn reject_alias_collision(
    fields: &[&FieldNode],
    parent_type: &str,
    reserved: &str,
) -> Result<(), RequestError> {
    match fields
        .iter()
        .find(|f| f.response_key() == reserved && f.name != reserved)
    {
        Some(field) => Err(RequestError::Validation(format!(
            "Alias \"{}\" for field \"{}\" on type \"{}\" is reserved for entity resolution.",
            reserved, field.name, parent_type
        ))),
        None => Ok(()),
    }
}

struct Splitter<'p> {
    schema: &'p Supergraph,
    operation: &'p Operation,
}

impl Splitter<'_> {
    /// Keeps what `service` can resolve on `parent_type` and moves the rest
    /// into dependent entity fetches against the owning subgraphs.
    fn split(
        &self,
        service: &str,
        parent_type: &str,
        selections: &[SelectionNode],
        path: &[String],
    ) -> Result<(Vec<SelectionNode>, Vec<FetchNode>), RequestError> {
        let is_root = parent_type == QUERY_TYPE || parent_type == MUTATION_TYPE;
        let mut local: Vec<SelectionNode> = Vec::new();
        let mut dependents = Vec::new();

        if self.schema.is_abstract(parent_type) {
            local.push(SelectionNode::Field(FieldNode::leaf("__typename")));
            local.extend(selections.iter().cloned().map(with_typenames));
            return Ok((local, dependents));
        }
        if !is_root {
            local.push(SelectionNode::Field(FieldNode::leaf("__typename")));
        }

        let mut fields = Vec::new();
        flatten_fields(self.schema, parent_type, selections, &mut fields);
        if !is_root {
            reject_alias_collision(&fields, parent_type, "__typename")?;
        }

        let mut remote: Vec<(String, Vec<SelectionNode>)> = Vec::new();
        for field in fields.iter().copied() {
            if field.name == "__typename" {
                if field.alias.is_some() {
                    local.push(SelectionNode::Field(field.clone()));
                }
                continue;
            }

            let info = self.schema.field(parent_type, &field.name).ok_or_else(|| {
                RequestError::Validation(format!(
                    "Cannot query field \"{}\" on type \"{}\".",
                    field.name, parent_type
                ))
            })?;

            if info.resolvable_by(service) {
                let mut kept = field.clone();
                if !field.selections.is_empty() {
                    let mut child_path = path.to_vec();
                    child_path.push(field.response_key().to_string());
                    let (selections, nested) =
                        self.split(service, &info.named_type, &field.selections, &child_path)?;
                    kept.selections = selections;
                    dependents.extend(nested);
                }
                local.push(SelectionNode::Field(kept));
            } else {
                match remote.iter_mut().find(|(owner, _)| *owner == info.owner) {
                    Some((_, pending)) => pending.push(SelectionNode::Field(field.clone())),
                    None => remote.push((info.owner.clone(), vec![SelectionNode::Field(field.clone())])),
                }
            }
        }

        for (owner, remote_fields) in remote {
            let key_fields = self
                .schema
                .get_type(parent_type)
                .and_then(|t| t.keys.get(&owner))
                .cloned()
                .ok_or_else(|| {
                    RequestError::Validation(format!(
                        "Cannot plan fields of type \"{}\" owned by subgraph \"{}\": no @key to resolve them.",
                        parent_type, owner
                    ))
                })?;

            for key in &key_fields {
                reject_alias_collision(&fields, parent_type, key)?;
                let present = local.iter().any(|node| {
                    matches!(node, SelectionNode::Field(f) if f.name == *key && f.alias.is_none())
                });
                if !present {
                    local.push(SelectionNode::Field(FieldNode::leaf(key)));
                }
            }

            let (selections, nested) = self.split(&owner, parent_type, &remote_fields, path)?;
            dependents.push(self.entity_fetch(owner, parent_type, key_fields, path, selections, nested));
        }

        Ok((local, dependents))
    }

    fn entity_fetch(
        &self,
        service: String,
        type_name: &str,
        key_fields: Vec<String>,
        path: &[String],
        selections: Vec<SelectionNode>,
        dependents: Vec<FetchNode>,
    ) -> FetchNode {
        let variables = used_variables(&selections);
        let mut definitions = vec!["$representations: [_Any!]!".to_string()];
        definitions.extend(self.variable_definitions(&variables));

        let mut text = format!(
            "query({}) {{ _entities(representations: $representations) {{ ... on {} ",
            definitions.join(", "),
            type_name
        );
        render_selection_set(&selections, &mut text);
        text.push_str(" } }");

        FetchNode {
            service,
            operation: text,
            operation_name: None,
            variables: variables.into_iter().collect(),
            kind: FetchKind::Entity {
                type_name: type_name.to_string(),
                key_fields,
                path: path.to_vec(),
            },
            dependents,
        }
    }

    fn variable_definitions(&self, used: &BTreeSet<String>) -> Vec<String> {
        self.operation
            .variable_definitions
            .iter()
            .filter(|d| used.contains(&d.name))
            .map(|d| d.rendered.clone())
            .collect()
    }
}

/// Adds `__typename` to every composite selection forwarded untouched.
fn with_typenames(node: SelectionNode) -> SelectionNode {
    match node {
        SelectionNode::Field(mut field) => {
            if !field.selections.is_empty() {
                let mut selections = vec![SelectionNode::Field(FieldNode::leaf("__typename"))];
                selections.extend(field.selections.into_iter().map(with_typenames));
                field.selections = selections;
            }
            SelectionNode::Field(field)
        }
        SelectionNode::InlineFragment {
            type_condition,
            selections,
        } => SelectionNode::InlineFragment {
            type_condition,
            selections: selections.into_iter().map(with_typenames).collect(),
        },
    }
}

fn used_variables(selections: &[SelectionNode]) -> BTreeSet<String> {
    fn collect(selections: &[SelectionNode], out: &mut BTreeSet<String>) {
        for selection in selections {
            match selection {
                SelectionNode::Field(field) => {
                    out.extend(field.variables.iter().cloned());
                    collect(&field.selections, out);
                }
                SelectionNode::InlineFragment { selections, .. } => collect(selections, out),
            }
        }
    }

    let mut out = BTreeSet::new();
    collect(selections, &mut out);
    out
}

pub(crate) fn render_selection_set(selections: &[SelectionNode], out: &mut String) {
    out.push('{');
    for selection in selections {
        out.push(' ');
        match selection {
            SelectionNode::Field(field) => {
                if let Some(alias) = &field.alias {
                    out.push_str(alias);
                    out.push_str(": ");
                }
                out.push_str(&field.name);
                if !field.arguments.is_empty() {
                    let arguments: Vec<String> = field
                        .arguments
                        .iter()
                        .map(|(name, value)| format!("{}: {}", name, value))
                        .collect();
                    out.push_str(&format!("({})", arguments.join(", ")));
                }
                for directive in &field.directives {
                    out.push(' ');
                    out.push_str(directive);
                }
                if !field.selections.is_empty() {
                    out.push(' ');
                    render_selection_set(&field.selections, out);
                }
            }
            SelectionNode::InlineFragment {
                type_condition,
                selections,
            } => {
                out.push_str("...");
                if let Some(condition) = type_condition {
                    out.push_str(" on ");
                    out.push_str(condition);
                }
                out.push(' ');
                render_selection_set(selections, out);
            }
        }
    }
    out.push_str(" }");
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SubgraphConfig, SubgraphSchema, compose};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const AUTH_SDL: &str = r#"
        type User @key(fields: "id") {
          id: ID!
          username: String!
          email: String!
        }
        type Query {
          currentUser: User
          getUser(id: ID!): User
        }
        type Mutation { logout: Boolean }
    "#;

    const COMMUNITY_SDL: &str = r#"
        type CommunityPost @key(fields: "id") {
          id: ID!
          author: User!
          title: String!
        }
        extend type User @key(fields: "id") {
          id: ID!
        }
        interface Node { id: ID! }
        type HelpRequest implements Node @key(fields: "id") {
          id: ID!
          description: String!
        }
        extend type Query {
          getAllPosts: [CommunityPost]
          node(id: ID!): Node
        }
        extend type Mutation {
          createPost(title: String!): CommunityPost
          deletePost(id: ID!): Boolean
        }
    "#;

    fn supergraph() -> Supergraph {
        compose(&[
            SubgraphSchema {
                config: SubgraphConfig::new("auth-service", "http://auth/graphql"),
                sdl: AUTH_SDL.to_string(),
            },
            SubgraphSchema {
                config: SubgraphConfig::new("community-service", "http://community/graphql"),
                sdl: COMMUNITY_SDL.to_string(),
            },
        ])
        .unwrap()
    }

    fn plan(query: &str) -> Result<QueryPlan, RequestError> {
        SimpleQueryPlanner::new().plan_query(&GraphQLRequest::new(query), &supergraph())
    }

    #[test]
    fn single_subgraph_query() {
        let plan = plan("{ currentUser { username } }").unwrap();

        assert_eq!(plan.fetches.len(), 1);
        let fetch = &plan.fetches[0];
        assert_eq!(fetch.service, "auth-service");
        assert_eq!(fetch.operation, "query { currentUser { __typename username } }");
        assert_eq!(
            fetch.kind,
            FetchKind::Root {
                response_keys: vec!["currentUser".to_string()]
            }
        );
        assert!(fetch.dependents.is_empty());
    }

    #[test]
    fn root_fields_are_grouped_by_owner() {
        let plan = plan("{ currentUser { id } posts: getAllPosts { title } me: currentUser { email } }")
            .unwrap();

        assert_eq!(plan.fetches.len(), 2);
        assert_eq!(plan.fetches[0].service, "auth-service");
        assert_eq!(
            plan.fetches[0].operation,
            "query { currentUser { __typename id } me: currentUser { __typename email } }"
        );
        assert_eq!(plan.fetches[1].service, "community-service");
        assert_eq!(
            plan.fetches[1].kind,
            FetchKind::Root {
                response_keys: vec!["posts".to_string()]
            }
        );
    }

    #[test]
    fn entity_fields_become_dependent_fetches() {
        let plan = plan("{ getAllPosts { title author { username } } }").unwrap();

        let root = &plan.fetches[0];
        assert_eq!(root.service, "community-service");
        assert_eq!(
            root.operation,
            "query { getAllPosts { __typename title author { __typename id } } }"
        );

        assert_eq!(root.dependents.len(), 1);
        let entity = &root.dependents[0];
        assert_eq!(entity.service, "auth-service");
        assert_eq!(
            entity.kind,
            FetchKind::Entity {
                type_name: "User".to_string(),
                key_fields: vec!["id".to_string()],
                path: vec!["getAllPosts".to_string(), "author".to_string()],
            }
        );
        assert_eq!(
            entity.operation,
            "query($representations: [_Any!]!) { _entities(representations: $representations) { ... on User { __typename username } } }"
        );
        assert_eq!(plan.fetch_count(), 2);
    }

    #[test]
    fn key_only_selection_needs_no_entity_fetch() {
        let plan = plan("{ getAllPosts { author { id } } }").unwrap();
        assert_eq!(plan.fetch_count(), 1);
    }

    #[test]
    fn variables_are_forwarded_only_where_used() {
        let request = GraphQLRequest::new(
            "query Lookup($id: ID!, $postId: ID!) { getUser(id: $id) { username } node(id: $postId) { id } }",
        )
        .with_variables(json!({ "id": "1", "postId": "2" }));
        let plan = SimpleQueryPlanner::new()
            .plan_query(&request, &supergraph())
            .unwrap();

        let auth = &plan.fetches[0];
        assert_eq!(auth.variables, vec!["id".to_string()]);
        assert_eq!(auth.operation_name.as_deref(), Some("Lookup__auth_service__0"));
        assert_eq!(
            auth.operation,
            "query Lookup__auth_service__0($id: ID!) { getUser(id: $id) { __typename username } }"
        );

        let community = &plan.fetches[1];
        assert_eq!(community.variables, vec!["postId".to_string()]);
        assert_eq!(
            community.operation,
            "query Lookup__community_service__1($postId: ID!) { node(id: $postId) { __typename id } }"
        );
    }

    #[test]
    fn fragments_are_expanded() {
        let plan = plan(
            "query { currentUser { ...UserParts } } fragment UserParts on User { username email }",
        )
        .unwrap();
        assert_eq!(
            plan.fetches[0].operation,
            "query { currentUser { __typename username email } }"
        );
    }

    #[test]
    fn abstract_selections_are_forwarded_whole() {
        let plan = plan("{ node(id: \"1\") { id ... on HelpRequest { description } } }").unwrap();
        assert_eq!(
            plan.fetches[0].operation,
            "query { node(id: \"1\") { __typename id ... on HelpRequest { description } } }"
        );
    }

    #[test]
    fn skip_and_include_are_evaluated() {
        let request = GraphQLRequest::new(
            "query($withEmail: Boolean!) { currentUser { username email @include(if: $withEmail) id @skip(if: true) } }",
        )
        .with_variables(json!({ "withEmail": false }));
        let plan = SimpleQueryPlanner::new()
            .plan_query(&request, &supergraph())
            .unwrap();

        assert_eq!(
            plan.fetches[0].operation,
            "query { currentUser { __typename username } }"
        );
    }

    #[test]
    fn mutations_keep_document_order() {
        let plan = plan(
            "mutation { a: createPost(title: \"x\") { id } logout b: deletePost(id: \"1\") c: deletePost(id: \"2\") }",
        )
        .unwrap();

        let services: Vec<&str> = plan.fetches.iter().map(|f| f.service.as_str()).collect();
        assert_eq!(
            services,
            vec!["community-service", "auth-service", "community-service"]
        );
        assert_eq!(
            plan.fetches[2].operation,
            "mutation { b: deletePost(id: \"1\") c: deletePost(id: \"2\") }"
        );
    }

    #[test]
    fn typename_only_query_needs_no_fetch() {
        let plan = plan("{ __typename }").unwrap();
        assert!(plan.fetches.is_empty());
    }

    #[test]
    fn invalid_queries_are_rejected() {
        assert!(matches!(plan("{ currentUser { "), Err(RequestError::Parse(_))));

        let cases = [
            ("{ nope }", "Cannot query field \"nope\" on type \"Query\"."),
            ("{ currentUser }", "Field \"currentUser\" of type \"User\" must have a selection of subfields."),
            ("{ currentUser { username { x } } }", "Field \"username\" must not have a selection since type \"String!\" has no subfields."),
            ("{ currentUser { ...Missing } }", "Unknown fragment \"Missing\"."),
            ("{ currentUser { ... on Ghost { id } } }", "Unknown type \"Ghost\"."),
            ("query A { currentUser { id } } query B { currentUser { id } }", "Must provide operation name if query contains multiple operations."),
            ("subscription { currentUser { id } }", "Subscriptions are not supported by this gateway."),
            ("{ getUser(id: $id) { id } }", "Variable \"$id\" is not defined."),
            ("{ __schema { types { name } } }", "Introspection field \"__schema\" is not supported by this gateway."),
            (
                "{ getAllPosts { author { id: __typename username } } }",
                "Alias \"id\" for field \"__typename\" on type \"User\" is reserved for entity resolution.",
            ),
            (
                "{ currentUser { __typename: username } }",
                "Alias \"__typename\" for field \"username\" on type \"User\" is reserved for entity resolution.",
            ),
            (
                "{ currentUser { ...A } } fragment A on User { ...B } fragment B on User { ...A }",
                "Cannot spread fragment \"A\" within itself.",
            ),
        ];

        for (query, message) in cases {
            assert_eq!(
                plan(query).unwrap_err(),
                RequestError::Validation(message.to_string()),
                "query: {query}"
            );
        }
    }

    #[test]
    fn operation_name_selects_operation() {
        let mut request =
            GraphQLRequest::new("query A { currentUser { id } } query B { getAllPosts { id } }");
        request.operation_name = Some("B".to_string());

        let plan = SimpleQueryPlanner::new()
            .plan_query(&request, &supergraph())
            .unwrap();
        assert_eq!(plan.fetches[0].service, "community-service");

        request.operation_name = Some("C".to_string());
        assert_eq!(
            SimpleQueryPlanner::new()
                .plan_query(&request, &supergraph())
                .unwrap_err(),
            RequestError::Validation("Unknown operation named \"C\".".to_string())
        );
    }
}
